// src/exec/local.rs

//! Run jobs as local processes.
//!
//! The job's commands are rendered into its `P.run` script, which is then
//! executed with `sh`. A monitor task waits for the process and reports an
//! `EndOfJob` message; destroying the handle kills the process through a
//! cancel channel.

use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::backend::{JobProcess, JobRunner, StartRequest};
use crate::commands::{CommandContext, script};
use crate::connector::Marker;
use crate::resource::{Message, MessageSender, ResourceId};

#[derive(Debug, Clone)]
pub struct LocalJobRunner {
    shell: String,
}

impl Default for LocalJobRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl JobRunner for LocalJobRunner {
    fn start_job(&self, request: StartRequest<'_>) -> Result<Box<dyn JobProcess>> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("local jobs need a running tokio runtime")?;

        let connector = request.connector.as_ref();
        let mut ctx = CommandContext::new(connector, request.path);
        let text = script::render(request.commands, &mut ctx, request.path)
            .with_context(|| format!("rendering run script for job {}", request.job))?;
        let run_path = Marker::Run.path_for(request.path);
        connector
            .write(&run_path, text.as_bytes())
            .with_context(|| format!("writing run script for job {}", request.job))?;

        let script_path = connector.resolve(&run_path);
        let child = {
            let _guard = runtime.enter();
            Command::new(&self.shell)
                .arg(&script_path)
                .current_dir(ctx.working_directory())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .with_context(|| format!("spawning {:?} for job {}", script_path, request.job))?
        };
        let pid = child
            .id()
            .map(|id| id.to_string())
            .ok_or_else(|| anyhow!("process for job {} exited before it got a pid", request.job))?;

        info!(job = %request.job, pid = %pid, script = %script_path.display(), "job process started");

        let exit_code = Arc::new(Mutex::new(None));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        runtime.spawn(monitor(
            request.job,
            child,
            cancel_rx,
            Arc::clone(&exit_code),
            request.messages.clone(),
        ));

        Ok(Box::new(LocalProcess {
            pid,
            exit_code,
            cancel: Mutex::new(Some(cancel_tx)),
        }))
    }
}

/// Wait for the process (or a kill request) and report its end.
async fn monitor(
    job: ResourceId,
    mut child: Child,
    mut cancel_rx: oneshot::Receiver<()>,
    exit_code: Arc<Mutex<Option<i32>>>,
    messages: MessageSender,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut cancel_rx => {
            info!(job = %job, "killing job process");
            if let Err(e) = child.start_kill() {
                warn!(job = %job, error = %e, "failed to kill job process");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            error!(job = %job, error = %e, "waiting for job process failed");
            -1
        }
    };
    *exit_code.lock().unwrap_or_else(PoisonError::into_inner) = Some(code);
    info!(job = %job, exit_code = code, "job process exited");

    if messages.send(Message::end_of_job(job, code)).is_err() {
        debug!(job = %job, "scheduler gone; end of job not delivered");
    }
}

#[derive(Debug)]
struct LocalProcess {
    pid: String,
    exit_code: Arc<Mutex<Option<i32>>>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl JobProcess for LocalProcess {
    fn pid(&self) -> &str {
        &self.pid
    }

    fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn destroy(&self) -> Result<()> {
        let cancel = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| anyhow!("process {} is no longer tracked", self.pid))?;
        cancel
            .send(())
            .map_err(|_| anyhow!("process {} already finished", self.pid))
    }

    fn dispose(&mut self) -> Result<()> {
        // Dropping the sender leaves the monitor waiting on the process only.
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}
