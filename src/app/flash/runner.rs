use std::io::BufRead;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::app::error::AppError;
use crate::app::flash::parse::{parse_flash_line, FlashEvent};

#[derive(Debug)]
pub enum RunnerMessage {
    Event(FlashEvent),
    Exited { code: Option<i32> },
}

/// Handle to a running flashing-tool process. `stop()` kills the child even
/// if the reader is blocked mid-line.
#[derive(Debug)]
pub struct FlashRunnerHandle {
    stop_flag: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
    join: Option<JoinHandle<()>>,
}

impl FlashRunnerHandle {
    pub fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Ok(mut guard) = self.child.lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawn the flashing tool and stream its line-oriented events back through
/// `events`. The final message is always `Exited`.
pub fn spawn_flash_runner(
    program: &str,
    args: &[String],
    events: mpsc::UnboundedSender<RunnerMessage>,
) -> Result<FlashRunnerHandle, AppError> {
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            AppError::system(format!("Failed to spawn flashing tool {program}: {err}"), "")
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture flashing tool stdout", ""))?;
    let stderr = child.stderr.take();

    let stop_flag = Arc::new(AtomicBool::new(false));
    let child_slot: Arc<Mutex<Option<Child>>> = Arc::new(Mutex::new(Some(child)));

    let stderr_join = stderr.map(|stderr| {
        let stop_stderr = Arc::clone(&stop_flag);
        thread::spawn(move || {
            let reader = std::io::BufReader::new(stderr);
            for line in reader.lines() {
                if stop_stderr.load(Ordering::Relaxed) {
                    break;
                }
                let line = match line {
                    Ok(line) => line,
                    Err(_) => break,
                };
                if !line.trim().is_empty() {
                    warn!(stderr = %line, "flashing tool stderr");
                }
            }
        })
    });

    let stop_reader = Arc::clone(&stop_flag);
    let child_reader = Arc::clone(&child_slot);
    let join = thread::spawn(move || {
        let reader = std::io::BufReader::new(stdout);
        for line in reader.lines() {
            if stop_reader.load(Ordering::Relaxed) {
                break;
            }
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = %err, "failed to read flashing tool stdout");
                    break;
                }
            };
            if let Some(event) = parse_flash_line(&line) {
                if events.send(RunnerMessage::Event(event)).is_err() {
                    break;
                }
            }
        }

        // Reap the child and report how it went. stop() may already have
        // taken it, in which case the exit code is unknown.
        let code = child_reader
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .and_then(|mut child| child.wait().ok())
            .and_then(|status| status.code());
        debug!(?code, "flashing tool exited");
        let _ = events.send(RunnerMessage::Exited { code });

        if let Some(join) = stderr_join {
            let _ = join.join();
        }
    });

    Ok(FlashRunnerHandle {
        stop_flag,
        child: child_slot,
        join: Some(join),
    })
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    fn collect_until_exit(
        receiver: &mut mpsc::UnboundedReceiver<RunnerMessage>,
    ) -> (Vec<FlashEvent>, Option<i32>) {
        let mut events = Vec::new();
        loop {
            match receiver.blocking_recv() {
                Some(RunnerMessage::Event(event)) => events.push(event),
                Some(RunnerMessage::Exited { code }) => return (events, code),
                None => return (events, None),
            }
        }
    }

    #[test]
    fn streams_events_and_reports_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let script = concat!(
            "echo '{\"event\":\"finding_device\"}'; ",
            "echo 'not json chatter'; ",
            "echo '{\"event\":\"step_changed\",\"step\":1,\"title\":\"boot\"}'"
        );
        let handle = spawn_flash_runner(
            "sh",
            &["-c".to_string(), script.to_string()],
            tx,
        )
        .expect("spawn");

        let (events, code) = collect_until_exit(&mut rx);
        assert_eq!(code, Some(0));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], FlashEvent::FindingDevice);
        handle.stop();
    }

    #[test]
    fn stop_kills_a_long_running_tool() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_flash_runner(
            "sh",
            &["-c".to_string(), "sleep 30".to_string()],
            tx,
        )
        .expect("spawn");

        handle.stop();
        let (_, code) = collect_until_exit(&mut rx);
        // Killed before a normal exit: no meaningful status code.
        assert!(code.is_none() || code != Some(0));
    }

    #[test]
    fn missing_tool_surfaces_a_spawn_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = spawn_flash_runner("/definitely/not/a/flasher", &[], tx).unwrap_err();
        assert_eq!(err.code, "ERR_SYSTEM");
    }
}
