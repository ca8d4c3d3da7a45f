//! Directive rendering for worker processes.

use minijinja::Environment;
use serde::Serialize;

const DIRECTIVE_TEMPLATE: &str = include_str!("templates/directive.md.jinja");

/// Context data passed to the directive template.
#[derive(Debug, Clone, Serialize)]
pub struct DirectiveContext {
    pub project: String,
    pub worker: String,
    /// Branch the worker's tree is on.
    pub branch: String,
    /// Tracker program name, for the close instruction.
    pub tracker: String,
    pub task: TaskInfo,
    /// Project context file contents.
    pub context: Option<String>,
    /// Set when relaunching after a run left uncommitted changes.
    pub attempt: Option<u32>,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: String,
    pub title: String,
    pub detail: String,
}

pub fn render_directive(ctx: &DirectiveContext) -> anyhow::Result<String> {
    let mut env = Environment::new();
    env.add_template("directive", DIRECTIVE_TEMPLATE)?;

    let template = env.get_template("directive")?;
    let rendered = template.render(ctx)?;

    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> DirectiveContext {
        DirectiveContext {
            project: "myapp".into(),
            worker: "worker-2".into(),
            branch: "isolated/bd-7".into(),
            tracker: "bd".into(),
            task: TaskInfo {
                id: "bd-7".into(),
                title: "Fix the parser".into(),
                detail: "bd-7: Fix the parser\nStatus: open\n".into(),
            },
            context: None,
            attempt: None,
            max_attempts: 5,
        }
    }

    #[test]
    fn test_render_directive() {
        let out = render_directive(&context()).unwrap();
        assert!(out.contains("You are worker-2"));
        assert!(out.contains("## Task bd-7: Fix the parser"));
        assert!(out.contains("Status: open"));
        assert!(out.contains("bd close bd-7"));
        assert!(!out.contains("## Retry"));
        assert!(!out.contains("## Project context"));
    }

    #[test]
    fn test_render_directive_with_retry_and_context() {
        let mut ctx = context();
        ctx.attempt = Some(2);
        ctx.context = Some("Run `just test` before committing.\n".into());
        let out = render_directive(&ctx).unwrap();
        assert!(out.contains("This is attempt 2 of 5."));
        assert!(out.contains("## Project context"));
        assert!(out.contains("Run `just test` before committing."));
    }

    #[test]
    fn test_render_directive_without_detail() {
        let mut ctx = context();
        ctx.task.detail = String::new();
        let out = render_directive(&ctx).unwrap();
        assert!(out.contains("No further detail was recorded"));
    }
}
