//! Turn a command template into a concrete, bounded argument vector.

use crate::logging::AUDIT;
use crate::template::{TemplateContext, TemplateDiagnostic};
use log::{debug, error, warn};

/// Upper bound on the number of arguments handed to any helper.
pub const MAX_ARGS: usize = 126;

/// Accumulates expanded arguments, dropping empty ones.
#[derive(Debug, Default, Clone)]
pub struct ArgvBuilder {
    args: Vec<String>,
    overflowed: bool,
}

impl ArgvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expand one pattern and append the result unless it is empty.
    pub fn push(&mut self, ctx: &mut TemplateContext, pattern: &str) {
        let arg = ctx.resolve(pattern);
        log_diagnostics(ctx);
        if arg.is_empty() {
            return;
        }
        if self.args.len() >= MAX_ARGS {
            if !self.overflowed {
                error!(
                    target: AUDIT,
                    "too many arguments to {}; truncating at {MAX_ARGS}",
                    self.args.first().map(String::as_str).unwrap_or("command")
                );
            }
            self.overflowed = true;
            return;
        }
        self.args.push(arg);
    }

    /// Expand every pattern of `template` in order.
    pub fn extend(&mut self, ctx: &mut TemplateContext, template: &[String]) {
        for pattern in template {
            self.push(ctx, pattern);
        }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn finish(self) -> Vec<String> {
        self.args
    }
}

/// Expand a whole template in one go.
pub fn build_argv(ctx: &mut TemplateContext, template: &[String]) -> Vec<String> {
    let mut builder = ArgvBuilder::new();
    builder.extend(ctx, template);
    builder.finish()
}

/// Render an argv for logs as `prog [arg] [arg]`.
pub fn format_argv(argv: &[String]) -> String {
    let mut out = String::new();
    for (index, arg) in argv.iter().enumerate() {
        if index == 0 {
            out.push_str(arg);
        } else {
            out.push_str(" [");
            out.push_str(arg);
            out.push(']');
        }
    }
    out
}

fn log_diagnostics(ctx: &mut TemplateContext) {
    for diagnostic in ctx.drain_diagnostics() {
        match diagnostic {
            TemplateDiagnostic::UndefinedKey(_) => debug!("template: {diagnostic}"),
            TemplateDiagnostic::Syntax(_) => warn!(target: AUDIT, "template: {diagnostic}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn empty_expansions_are_omitted() {
        let mut ctx = TemplateContext::new();
        ctx.set("MNTPT", "/mnt/x");
        ctx.set("OPTIONS", "");
        let argv = build_argv(
            &mut ctx,
            &owned(&["umount", "%(before=\"-o\" OPTIONS)", "%(KEYBITS)", "%(MNTPT)"]),
        );
        assert_eq!(argv, owned(&["umount", "/mnt/x"]));
        assert!(!ctx.has_diagnostics());
    }

    #[test]
    fn never_exceeds_bound() {
        let mut ctx = TemplateContext::new();
        ctx.set("X", "x");
        let template = vec!["%(X)".to_string(); MAX_ARGS + 10];
        let mut builder = ArgvBuilder::new();
        builder.extend(&mut ctx, &template);
        assert!(builder.overflowed());
        assert_eq!(builder.len(), MAX_ARGS);
        assert_eq!(builder.finish().len(), MAX_ARGS);
    }

    #[test]
    fn exactly_at_bound_is_not_overflow() {
        let mut ctx = TemplateContext::new();
        let template = vec!["a".to_string(); MAX_ARGS];
        let mut builder = ArgvBuilder::new();
        builder.extend(&mut ctx, &template);
        assert!(!builder.overflowed());
        assert_eq!(builder.len(), MAX_ARGS);
    }

    #[test]
    fn format_brackets_arguments() {
        assert_eq!(
            format_argv(&owned(&["mount", "-t", "ext4"])),
            "mount [-t] [ext4]"
        );
        assert_eq!(format_argv(&[]), "");
    }
}
