//! Isolated worker: one JSON request on stdin, one JSON result on stdout.

use secure_exec::worker;

fn main() {
    secure_exec::init_tracing();

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();

    if let Err(e) = worker::serve(stdin.lock(), stdout.lock()) {
        // The parent reads stderr and the exit code when no result arrives
        eprintln!("{}", e);
        std::process::exit(e.exit_code());
    }
}
