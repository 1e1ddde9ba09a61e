use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::contract::{ProcessExit, ProcessHandle, unix_now};
use crate::settings::RunnerSettings;
use crate::BenchError;

pub const GPU_DEVICE_ENV: &str = "GST_VAAPI_DRM_DEVICE";
pub const LATENCY_LOG_ENV: &str = "GST_DEBUG_FILE";

#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    pub runner: &'a str,
    pub settings: &'a RunnerSettings,
    pub run_dir: &'a Path,
    pub piperun_config: &'a Path,
    pub pipeline_root: &'a Path,
    pub systeminfo: &'a Path,
    /// Send the child's stdout/stderr to files in `run_dir`.
    pub redirect: bool,
    pub numa_node: Option<u32>,
    pub gpu_render_device: Option<&'a str>,
}

/// Fully resolved runner invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerCommand {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl RunnerCommand {
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

pub fn runner_command(request: &LaunchRequest<'_>) -> Result<RunnerCommand, BenchError> {
    let runner_root = request
        .pipeline_root
        .join("runners")
        .join(request.runner);

    let mut argv = match request.settings.run_command()? {
        Some(command) => command.argv()?,
        None => default_run(request.runner, &runner_root),
    };
    if argv.is_empty() {
        return Err(BenchError::Config(format!(
            "runner `{}` has an empty run command",
            request.runner
        )));
    }
    argv.push("--systeminfo".to_string());
    argv.push(request.systeminfo.display().to_string());
    argv.push(request.piperun_config.display().to_string());

    if let Some(node) = request.numa_node {
        if find_on_path("numactl").is_none() {
            return Err(BenchError::Config(format!(
                "numa node {node} requested but numactl is not installed"
            )));
        }
        let prefix = [
            "numactl".to_string(),
            format!("--cpunodebind={node}"),
            format!("--membind={node}"),
        ];
        argv.splice(0..0, prefix);
    }

    let mut child_env = Vec::new();
    if let Some(device) = request.gpu_render_device {
        if env::var_os(GPU_DEVICE_ENV).is_none() {
            child_env.push((GPU_DEVICE_ENV.to_string(), device.to_string()));
        }
    }
    if request.settings.trace_latency() {
        child_env.push((
            LATENCY_LOG_ENV.to_string(),
            request.run_dir.join("latency.log").display().to_string(),
        ));
    }

    let cwd = if runner_root.is_dir() {
        runner_root
    } else {
        request.run_dir.to_path_buf()
    };
    Ok(RunnerCommand {
        argv,
        cwd,
        env: child_env,
    })
}

/// `run.sh` in the runner directory; `mockrun` falls back to the sibling binary.
fn default_run(runner: &str, runner_root: &Path) -> Vec<String> {
    let script = runner_root.join("run.sh");
    if runner == "mockrun" && !script.is_file() {
        if let Some(mockrun) = env::current_exe()
            .ok()
            .map(|exe| exe.with_file_name("mockrun"))
            .filter(|path| path.is_file())
        {
            return vec![mockrun.display().to_string()];
        }
    }
    vec!["/bin/bash".to_string(), script.display().to_string()]
}

fn find_on_path(program: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

pub fn start_runner(request: &LaunchRequest<'_>) -> Result<RunnerProcess, BenchError> {
    let command = runner_command(request)?;
    let (stdout, stderr) = if request.redirect {
        let create = |name: &str| {
            let path = request.run_dir.join(name);
            File::create(&path)
                .map(Stdio::from)
                .map_err(|e| BenchError::io(format!("create {}", path.display()), e))
        };
        (create("stdout.txt")?, create("stderr.txt")?)
    } else {
        (Stdio::inherit(), Stdio::inherit())
    };

    info!(
        runner = request.runner,
        started = unix_now(),
        command = %command.display(),
        "launching runner"
    );
    let child = Command::new(&command.argv[0])
        .args(&command.argv[1..])
        .current_dir(&command.cwd)
        .envs(command.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .spawn()
        .map_err(|source| BenchError::Spawn {
            command: command.display(),
            source,
        })?;

    Ok(RunnerProcess {
        child,
        exit: None,
        label: request.runner.to_string(),
    })
}

/// A spawned runner; killed on drop if still running.
#[derive(Debug)]
pub struct RunnerProcess {
    child: Child,
    exit: Option<ProcessExit>,
    label: String,
}

impl RunnerProcess {
    fn signal(&mut self, sig: Signal) -> Result<(), BenchError> {
        if self.exit.is_some() {
            return Ok(());
        }
        let pid = Pid::from_raw(self.child.id() as i32);
        match signal::kill(pid, sig) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(errno) => Err(BenchError::io(
                format!("send {sig} to {}", self.label),
                std::io::Error::from(errno),
            )),
        }
    }
}

impl ProcessHandle for RunnerProcess {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn poll(&mut self) -> Result<Option<ProcessExit>, BenchError> {
        if self.exit.is_none() {
            self.exit = self
                .child
                .try_wait()
                .map_err(|e| BenchError::io(format!("poll {}", self.label), e))?
                .map(ProcessExit::from);
        }
        Ok(self.exit)
    }

    fn terminate(&mut self) -> Result<(), BenchError> {
        self.signal(Signal::SIGTERM)
    }

    fn kill(&mut self) -> Result<(), BenchError> {
        self.signal(Signal::SIGKILL)
    }

    fn wait(&mut self) -> Result<ProcessExit, BenchError> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let status = self
            .child
            .wait()
            .map_err(|e| BenchError::io(format!("wait {}", self.label), e))?;
        let exit = ProcessExit::from(status);
        self.exit = Some(exit);
        Ok(exit)
    }
}

impl Drop for RunnerProcess {
    fn drop(&mut self) {
        if self.exit.is_none() {
            if let Err(err) = self.child.kill() {
                warn!(runner = self.label.as_str(), error = %err, "failed to kill runner on drop");
            }
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::shutdown_process;
    use serde_json::json;
    use std::time::Duration;

    fn request<'a>(settings: &'a RunnerSettings, dir: &'a Path) -> LaunchRequest<'a> {
        LaunchRequest {
            runner: "dlstreamer",
            settings,
            run_dir: dir,
            piperun_config: Path::new("/runs/throughput.piperun.json"),
            pipeline_root: Path::new("/nonexistent/pipeline"),
            systeminfo: Path::new("/work/systeminfo.json"),
            redirect: true,
            numa_node: None,
            gpu_render_device: None,
        }
    }

    fn settings(value: serde_json::Value) -> RunnerSettings {
        match value {
            serde_json::Value::Object(map) => RunnerSettings::new(map),
            _ => unreachable!(),
        }
    }

    #[test]
    fn default_command_runs_script() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RunnerSettings::default();
        let command = runner_command(&request(&settings, dir.path())).unwrap();
        assert_eq!(
            command.argv,
            vec![
                "/bin/bash",
                "/nonexistent/pipeline/runners/dlstreamer/run.sh",
                "--systeminfo",
                "/work/systeminfo.json",
                "/runs/throughput.piperun.json",
            ]
        );
        assert_eq!(command.cwd, dir.path());
        assert!(command.env.is_empty());
    }

    #[test]
    fn custom_run_and_latency_trace() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(json!({"run": "python3 -m runner", "trace-latency": true}));
        let command = runner_command(&request(&settings, dir.path())).unwrap();
        assert_eq!(&command.argv[..3], ["python3", "-m", "runner"]);
        assert_eq!(
            command.env,
            vec![(
                LATENCY_LOG_ENV.to_string(),
                dir.path().join("latency.log").display().to_string()
            )]
        );
    }

    #[test]
    fn gpu_device_only_for_child() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RunnerSettings::default();
        let mut req = request(&settings, dir.path());
        req.gpu_render_device = Some("/dev/dri/renderD129");
        let command = runner_command(&req).unwrap();
        if env::var_os(GPU_DEVICE_ENV).is_none() {
            assert!(command.env.contains(&(
                GPU_DEVICE_ENV.to_string(),
                "/dev/dri/renderD129".to_string()
            )));
            assert!(env::var_os(GPU_DEVICE_ENV).is_none());
        }
    }

    #[test]
    fn numa_prefix_requires_numactl() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RunnerSettings::default();
        let mut req = request(&settings, dir.path());
        req.numa_node = Some(1);
        match runner_command(&req) {
            Ok(command) => assert_eq!(
                &command.argv[..3],
                ["numactl", "--cpunodebind=1", "--membind=1"]
            ),
            Err(err) => assert!(matches!(err, BenchError::Config(_))),
        }
    }

    #[test]
    fn redirected_runner_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(json!({"run": ["/bin/sh", "-c", "echo started; sleep 30", "sh"]}));
        let req = request(&settings, dir.path());
        let mut process = start_runner(&req).unwrap();
        assert_eq!(process.poll().unwrap(), None);
        std::thread::sleep(Duration::from_millis(100));
        let exit = shutdown_process(&mut process, Duration::from_secs(2)).unwrap();
        assert!(exit.is_expected(), "{exit}");
        let stdout = std::fs::read_to_string(dir.path().join("stdout.txt")).unwrap();
        assert_eq!(stdout.trim(), "started");
    }

    #[test]
    fn failing_runner_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(json!({"run": ["/bin/sh", "-c", "exit 3", "sh"]}));
        let mut process = start_runner(&request(&settings, dir.path())).unwrap();
        assert_eq!(process.wait().unwrap(), ProcessExit::Code(3));
        assert!(!ProcessExit::Code(3).is_expected());
    }
}
