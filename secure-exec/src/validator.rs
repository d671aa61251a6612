//! Static validation of scripts before execution.
//!
//! The script is parsed into a Python AST and walked once, depth-first in
//! source order. The walk stops at the first forbidden import, call or
//! attribute access. Anything that does not parse is rejected.

use rustpython_parser::{ast, Parse};
use serde::Serialize;

use crate::denylist::Denylist;

const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await",
    "break", "class", "continue", "def", "del", "elif", "else", "except",
    "finally", "for", "from", "global", "if", "import", "in", "is",
    "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

/// The kind of construct that caused a rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OffendingConstruct {
    Import,
    ImportFrom,
    Call,
    MethodCall,
    Attribute,
    Syntax,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ValidationVerdict {
    Accepted,
    Rejected {
        reason: String,
        construct: OffendingConstruct,
    },
}

impl ValidationVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationVerdict::Accepted)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ValidationVerdict::Accepted => None,
            ValidationVerdict::Rejected { reason, .. } => Some(reason),
        }
    }
}

/// First violation found by the walk
#[derive(Debug)]
struct Violation {
    reason: String,
    construct: OffendingConstruct,
}

impl Violation {
    fn new(construct: OffendingConstruct, reason: String) -> Self {
        Self { reason, construct }
    }
}

type Walk = Result<(), Violation>;

/// Checks scripts against a denylist
#[derive(Debug, Clone, Copy)]
pub struct Validator<'a> {
    denylist: &'a Denylist,
}

impl<'a> Validator<'a> {
    pub fn new(denylist: &'a Denylist) -> Self {
        Self { denylist }
    }

    /// Accept or reject a script. Pure; never executes anything.
    pub fn validate(&self, script: &str) -> ValidationVerdict {
        if script.trim().is_empty() {
            return ValidationVerdict::Accepted;
        }

        let suite = match ast::Suite::parse(script, "<generated>") {
            Ok(suite) => suite,
            Err(err) => {
                return ValidationVerdict::Rejected {
                    reason: format!("Syntax error in generated code: {}", err),
                    construct: OffendingConstruct::Syntax,
                };
            }
        };

        match self.visit_body(&suite) {
            Ok(()) => ValidationVerdict::Accepted,
            Err(violation) => ValidationVerdict::Rejected {
                reason: violation.reason,
                construct: violation.construct,
            },
        }
    }

    fn visit_body(&self, body: &[ast::Stmt]) -> Walk {
        body.iter().try_for_each(|stmt| self.visit_stmt(stmt))
    }

    fn visit_stmt(&self, stmt: &ast::Stmt) -> Walk {
        use ast::Stmt;

        match stmt {
            Stmt::Import(ast::StmtImport { names, .. }) => {
                for alias in names {
                    let module = top_level(alias.name.as_str());
                    if self.denylist.is_forbidden_module(module) {
                        return Err(Violation::new(
                            OffendingConstruct::Import,
                            format!("Import of '{}' is not allowed for security reasons", module),
                        ));
                    }
                }
                Ok(())
            }
            Stmt::ImportFrom(ast::StmtImportFrom { module, .. }) => {
                // `from . import x` has no module to check
                if let Some(module) = module {
                    let module = top_level(module.as_str());
                    if self.denylist.is_forbidden_module(module) {
                        return Err(Violation::new(
                            OffendingConstruct::ImportFrom,
                            format!("Import from '{}' is not allowed for security reasons", module),
                        ));
                    }
                }
                Ok(())
            }
            Stmt::FunctionDef(ast::StmtFunctionDef {
                args,
                body,
                decorator_list,
                returns,
                ..
            })
            | Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef {
                args,
                body,
                decorator_list,
                returns,
                ..
            }) => {
                self.visit_exprs(decorator_list)?;
                self.visit_arguments(args)?;
                self.visit_opt_expr(returns.as_deref())?;
                self.visit_body(body)
            }
            Stmt::ClassDef(ast::StmtClassDef {
                bases,
                keywords,
                body,
                decorator_list,
                ..
            }) => {
                self.visit_exprs(decorator_list)?;
                self.visit_exprs(bases)?;
                self.visit_keywords(keywords)?;
                self.visit_body(body)
            }
            Stmt::Return(ast::StmtReturn { value, .. }) => self.visit_opt_expr(value.as_deref()),
            Stmt::Delete(ast::StmtDelete { targets, .. }) => self.visit_exprs(targets),
            Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                self.visit_exprs(targets)?;
                self.visit_expr(value)
            }
            Stmt::AugAssign(ast::StmtAugAssign { target, value, .. }) => {
                self.visit_expr(target)?;
                self.visit_expr(value)
            }
            Stmt::AnnAssign(ast::StmtAnnAssign {
                target,
                annotation,
                value,
                ..
            }) => {
                self.visit_expr(target)?;
                self.visit_expr(annotation)?;
                self.visit_opt_expr(value.as_deref())
            }
            Stmt::For(ast::StmtFor {
                target,
                iter,
                body,
                orelse,
                ..
            })
            | Stmt::AsyncFor(ast::StmtAsyncFor {
                target,
                iter,
                body,
                orelse,
                ..
            }) => {
                self.visit_expr(target)?;
                self.visit_expr(iter)?;
                self.visit_body(body)?;
                self.visit_body(orelse)
            }
            Stmt::While(ast::StmtWhile {
                test, body, orelse, ..
            })
            | Stmt::If(ast::StmtIf {
                test, body, orelse, ..
            }) => {
                self.visit_expr(test)?;
                self.visit_body(body)?;
                self.visit_body(orelse)
            }
            Stmt::With(ast::StmtWith { items, body, .. })
            | Stmt::AsyncWith(ast::StmtAsyncWith { items, body, .. }) => {
                for item in items {
                    self.visit_expr(&item.context_expr)?;
                    self.visit_opt_expr(item.optional_vars.as_deref())?;
                }
                self.visit_body(body)
            }
            Stmt::Match(ast::StmtMatch { subject, cases, .. }) => {
                self.visit_expr(subject)?;
                for case in cases {
                    self.visit_pattern(&case.pattern)?;
                    self.visit_opt_expr(case.guard.as_deref())?;
                    self.visit_body(&case.body)?;
                }
                Ok(())
            }
            Stmt::Raise(ast::StmtRaise { exc, cause, .. }) => {
                self.visit_opt_expr(exc.as_deref())?;
                self.visit_opt_expr(cause.as_deref())
            }
            Stmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            })
            | Stmt::TryStar(ast::StmtTryStar {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            }) => {
                self.visit_body(body)?;
                for handler in handlers {
                    let ast::ExceptHandler::ExceptHandler(handler) = handler;
                    self.visit_opt_expr(handler.type_.as_deref())?;
                    self.visit_body(&handler.body)?;
                }
                self.visit_body(orelse)?;
                self.visit_body(finalbody)
            }
            Stmt::Assert(ast::StmtAssert { test, msg, .. }) => {
                self.visit_expr(test)?;
                self.visit_opt_expr(msg.as_deref())
            }
            Stmt::Expr(ast::StmtExpr { value, .. }) => self.visit_expr(value),
            // pass, break, continue, global, nonlocal
            _ => Ok(()),
        }
    }

    fn visit_exprs(&self, exprs: &[ast::Expr]) -> Walk {
        exprs.iter().try_for_each(|expr| self.visit_expr(expr))
    }

    fn visit_opt_expr(&self, expr: Option<&ast::Expr>) -> Walk {
        match expr {
            Some(expr) => self.visit_expr(expr),
            None => Ok(()),
        }
    }

    fn visit_keywords(&self, keywords: &[ast::Keyword]) -> Walk {
        keywords.iter().try_for_each(|kw| self.visit_expr(&kw.value))
    }

    fn visit_arguments(&self, args: &ast::Arguments) -> Walk {
        let with_defaults = args
            .posonlyargs
            .iter()
            .chain(args.args.iter())
            .chain(args.kwonlyargs.iter());
        for arg in with_defaults {
            self.visit_opt_expr(arg.def.annotation.as_deref())?;
            self.visit_opt_expr(arg.default.as_deref())?;
        }
        for arg in args.vararg.iter().chain(args.kwarg.iter()) {
            self.visit_opt_expr(arg.annotation.as_deref())?;
        }
        Ok(())
    }

    fn visit_comprehensions(&self, generators: &[ast::Comprehension]) -> Walk {
        for generator in generators {
            self.visit_expr(&generator.target)?;
            self.visit_expr(&generator.iter)?;
            self.visit_exprs(&generator.ifs)?;
        }
        Ok(())
    }

    fn check_attribute(&self, name: &str) -> Walk {
        match self.denylist.forbidden_attribute_pattern(name) {
            Some(_) => Err(Violation::new(
                OffendingConstruct::Attribute,
                format!("Access to attribute '{}' is not allowed for security reasons", name),
            )),
            None => Ok(()),
        }
    }

    fn visit_expr(&self, expr: &ast::Expr) -> Walk {
        use ast::Expr;

        match expr {
            Expr::Call(ast::ExprCall {
                func,
                args,
                keywords,
                ..
            }) => {
                match func.as_ref() {
                    Expr::Name(ast::ExprName { id, .. }) => {
                        if self.denylist.is_forbidden_call(id.as_str()) {
                            return Err(Violation::new(
                                OffendingConstruct::Call,
                                format!("Call to '{}' is not allowed for security reasons", id.as_str()),
                            ));
                        }
                        self.check_attribute(id.as_str())?;
                    }
                    Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
                        self.visit_expr(value)?;
                        self.check_attribute(attr.as_str())?;
                        if self.denylist.is_forbidden_method_call(attr.as_str()) {
                            return Err(Violation::new(
                                OffendingConstruct::MethodCall,
                                format!("Call to '{}' is not allowed for security reasons", attr.as_str()),
                            ));
                        }
                    }
                    other => self.visit_expr(other)?,
                }
                self.visit_exprs(args)?;
                self.visit_keywords(keywords)
            }
            Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
                self.visit_expr(value)?;
                self.check_attribute(attr.as_str())
            }
            // `__builtins__` and friends are as dangerous bare as they are
            // behind a dot
            Expr::Name(ast::ExprName { id, .. }) => self.check_attribute(id.as_str()),
            Expr::BoolOp(ast::ExprBoolOp { values, .. }) => self.visit_exprs(values),
            Expr::NamedExpr(ast::ExprNamedExpr { target, value, .. }) => {
                self.visit_expr(target)?;
                self.visit_expr(value)
            }
            Expr::BinOp(ast::ExprBinOp { left, right, .. }) => {
                self.visit_expr(left)?;
                self.visit_expr(right)
            }
            Expr::UnaryOp(ast::ExprUnaryOp { operand, .. }) => self.visit_expr(operand),
            Expr::Lambda(ast::ExprLambda { args, body, .. }) => {
                self.visit_arguments(args)?;
                self.visit_expr(body)
            }
            Expr::IfExp(ast::ExprIfExp {
                test, body, orelse, ..
            }) => {
                self.visit_expr(body)?;
                self.visit_expr(test)?;
                self.visit_expr(orelse)
            }
            Expr::Dict(ast::ExprDict { keys, values, .. }) => {
                for (key, value) in keys.iter().zip(values.iter()) {
                    self.visit_opt_expr(key.as_ref())?;
                    self.visit_expr(value)?;
                }
                Ok(())
            }
            Expr::Set(ast::ExprSet { elts, .. })
            | Expr::List(ast::ExprList { elts, .. })
            | Expr::Tuple(ast::ExprTuple { elts, .. }) => self.visit_exprs(elts),
            Expr::ListComp(ast::ExprListComp {
                elt, generators, ..
            })
            | Expr::SetComp(ast::ExprSetComp {
                elt, generators, ..
            })
            | Expr::GeneratorExp(ast::ExprGeneratorExp {
                elt, generators, ..
            }) => {
                self.visit_expr(elt)?;
                self.visit_comprehensions(generators)
            }
            Expr::DictComp(ast::ExprDictComp {
                key,
                value,
                generators,
                ..
            }) => {
                self.visit_expr(key)?;
                self.visit_expr(value)?;
                self.visit_comprehensions(generators)
            }
            Expr::Await(ast::ExprAwait { value, .. })
            | Expr::YieldFrom(ast::ExprYieldFrom { value, .. })
            | Expr::Starred(ast::ExprStarred { value, .. }) => self.visit_expr(value),
            Expr::Yield(ast::ExprYield { value, .. }) => self.visit_opt_expr(value.as_deref()),
            Expr::Compare(ast::ExprCompare {
                left, comparators, ..
            }) => {
                self.visit_expr(left)?;
                self.visit_exprs(comparators)
            }
            Expr::FormattedValue(ast::ExprFormattedValue {
                value, format_spec, ..
            }) => {
                self.visit_expr(value)?;
                self.visit_opt_expr(format_spec.as_deref())
            }
            Expr::JoinedStr(ast::ExprJoinedStr { values, .. }) => self.visit_exprs(values),
            Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.visit_expr(value)?;
                self.visit_expr(slice)
            }
            Expr::Slice(ast::ExprSlice {
                lower, upper, step, ..
            }) => {
                self.visit_opt_expr(lower.as_deref())?;
                self.visit_opt_expr(upper.as_deref())?;
                self.visit_opt_expr(step.as_deref())
            }
            // constants
            _ => Ok(()),
        }
    }

    fn visit_pattern(&self, pattern: &ast::Pattern) -> Walk {
        use ast::Pattern;

        match pattern {
            Pattern::MatchValue(ast::PatternMatchValue { value, .. }) => self.visit_expr(value),
            Pattern::MatchSequence(ast::PatternMatchSequence { patterns, .. })
            | Pattern::MatchOr(ast::PatternMatchOr { patterns, .. }) => {
                patterns.iter().try_for_each(|p| self.visit_pattern(p))
            }
            Pattern::MatchMapping(ast::PatternMatchMapping { keys, patterns, .. }) => {
                self.visit_exprs(keys)?;
                patterns.iter().try_for_each(|p| self.visit_pattern(p))
            }
            Pattern::MatchClass(ast::PatternMatchClass {
                cls,
                patterns,
                kwd_attrs,
                kwd_patterns,
                ..
            }) => {
                self.visit_expr(cls)?;
                patterns.iter().try_for_each(|p| self.visit_pattern(p))?;
                // keyword patterns read attributes off the subject
                for attr in kwd_attrs {
                    self.check_attribute(attr.as_str())?;
                }
                kwd_patterns.iter().try_for_each(|p| self.visit_pattern(p))
            }
            Pattern::MatchAs(ast::PatternMatchAs { pattern, .. }) => match pattern {
                Some(inner) => self.visit_pattern(inner),
                None => Ok(()),
            },
            // singletons and star captures
            _ => Ok(()),
        }
    }
}

fn top_level(module: &str) -> &str {
    module.split('.').next().unwrap_or(module)
}

/// Check that a trusted binding can be injected as a global.
///
/// Rules:
/// - Must be a valid identifier (letter or underscore, then letters, digits, underscores)
/// - Cannot start with a double underscore (would shadow interpreter internals)
/// - Cannot be a Python keyword
pub fn validate_binding_name(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let first_char = match chars.next() {
        Some(c) => c,
        None => return Err("Binding name cannot be empty".to_string()),
    };

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(format!(
            "Binding name must start with a letter or underscore, got '{}'",
            first_char
        ));
    }

    if let Some((i, c)) = name
        .chars()
        .enumerate()
        .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_')
    {
        return Err(format!(
            "Binding name can only contain letters, digits, and underscores. \
            Invalid character '{}' at position {}",
            c, i
        ));
    }

    if name.starts_with("__") {
        return Err(format!("Binding name '{}' cannot start with '__'", name));
    }

    if PYTHON_KEYWORDS.contains(&name) {
        return Err(format!("'{}' is a Python reserved keyword", name));
    }

    Ok(())
}
