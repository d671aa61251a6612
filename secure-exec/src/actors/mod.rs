pub mod sandbox_actor;

pub use sandbox_actor::{SandboxActor, SandboxMsg};
