// src/commands/script.rs

//! Render a job's commands as a POSIX shell script (the `P.run` file).
//!
//! The script runs the commands in a `set -e` group with stdout/stderr sent
//! to `P.out`/`P.err`, writes the exit code to `P.code` and touches
//! `P.done` on success, so the outcome survives a scheduler restart.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;

use super::{Command, CommandComponent, CommandContext, Commands};
use crate::connector::Marker;

pub fn render(commands: &Commands, ctx: &mut CommandContext<'_>, job_path: &Path) -> Result<String> {
    let mut body = Vec::new();
    for command in commands.iter() {
        let line = render_command(command, ctx, &mut body)?;
        body.push(line);
    }

    let marker = |m: Marker| quote_path(&ctx.resolve(&m.path_for(job_path)));
    let (out, err, code, done) = (
        marker(Marker::Out),
        marker(Marker::Err),
        marker(Marker::Code),
        marker(Marker::Done),
    );

    let mut script = String::new();
    writeln!(script, "#!/bin/sh")?;
    writeln!(script, "# labflow job {}", job_path.display())?;
    writeln!(script, "cd {} || exit 126", quote_path(&ctx.working_directory()))?;
    writeln!(script, "rm -f {} {}", code, done)?;
    if !ctx.pipes().is_empty() {
        let pipes: Vec<String> = ctx.pipes().iter().map(|p| quote_path(p)).collect();
        writeln!(script, "cleanup() {{")?;
        writeln!(script, "  rm -f {}", pipes.join(" "))?;
        writeln!(script, "}}")?;
        writeln!(script, "trap cleanup EXIT")?;
    }
    writeln!(script, "(")?;
    writeln!(script, "  set -e")?;
    for line in &body {
        writeln!(script, "  {}", line)?;
    }
    writeln!(script, ") > {} 2> {}", out, err)?;
    writeln!(script, "code=$?")?;
    writeln!(script, "echo $code > {}", code)?;
    writeln!(script, "if [ $code -eq 0 ]; then touch {}; fi", done)?;
    writeln!(script, "exit $code")?;
    Ok(script)
}

/// One command line. Pipe producers are appended to `body` first, started
/// in the background on a fresh named pipe.
fn render_command(
    command: &Command,
    ctx: &mut CommandContext<'_>,
    body: &mut Vec<String>,
) -> Result<String> {
    let mut args = Vec::with_capacity(command.components.len());
    for component in &command.components {
        let arg = match component {
            CommandComponent::Literal { value } => quote(value),
            CommandComponent::Path { path } => quote_path(&ctx.resolve(path)),
            CommandComponent::ParameterFile { key, content } => {
                quote_path(&ctx.write_parameter_file(key, content)?)
            }
            CommandComponent::WorkingDirectory => quote_path(&ctx.working_directory()),
            CommandComponent::Pipe { command } => {
                let fifo = quote_path(&ctx.new_pipe());
                body.push(format!("mkfifo {}", fifo));
                let producer = render_command(command, ctx, body)?;
                body.push(format!("{} > {} &", producer, fifo));
                fifo
            }
        };
        args.push(arg);
    }
    Ok(args.join(" "))
}

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c)
}

/// Single-quote `s` for the shell unless it is plainly safe.
pub fn quote(s: &str) -> String {
    if !s.is_empty() && s.chars().all(is_safe) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::mock::MockConnector;

    #[test]
    fn quoting() {
        assert_eq!(quote("plain-arg_1.txt"), "plain-arg_1.txt");
        assert_eq!(quote("two words"), "'two words'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn script_runs_producers_before_consumers() {
        let conn = MockConnector::default();
        let job = Path::new("jobs/count");
        let mut ctx = CommandContext::new(&conn, job);
        let commands = Commands::single(
            Command::from_args(["wc", "-l"]).pipe(Command::from_args(["cat", "in put"])),
        );
        let script = render(&commands, &mut ctx, job).unwrap();

        let mkfifo = script.find("mkfifo jobs/count.pipe-0001.fifo").unwrap();
        let producer = script
            .find("cat 'in put' > jobs/count.pipe-0001.fifo &")
            .unwrap();
        let consumer = script.find("wc -l jobs/count.pipe-0001.fifo").unwrap();
        assert!(mkfifo < producer && producer < consumer);
        assert!(script.contains("trap cleanup EXIT"));
        assert!(script.contains(") > jobs/count.out 2> jobs/count.err"));
        assert!(script.contains("echo $code > jobs/count.code"));
        assert!(script.contains("touch jobs/count.done"));
    }

    #[test]
    fn parameter_files_are_materialised() {
        let conn = MockConnector::default();
        let job = Path::new("jobs/train");
        let mut ctx = CommandContext::new(&conn, job);
        let commands = Commands::single(Command::from_args(["train"]).parameter_file("cfg", "lr=1"));
        let script = render(&commands, &mut ctx, job).unwrap();
        assert!(script.contains("train jobs/train.cfg.input"));
        assert_eq!(conn.file("jobs/train.cfg.input").as_deref(), Some("lr=1"));
        assert!(!script.contains("cleanup()"));
    }
}
