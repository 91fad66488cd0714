//! Fakes shared by the integration tests

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::SecretString;

use tagflash::deploy::command::{CommandOutput, CommandRunner, CommandSpec};
use tagflash::deploy::devices::{BoardFamily, Device, DeviceBackend, DeviceLocator};
use tagflash::deploy::flash::{FlashOptions, FlashOrchestrator, FlashPolicy};
use tagflash::deploy::git::{GitOptions, SourceFetcher};
use tagflash::deploy::pipeline::{DeploymentPipeline, PipelineOptions};
use tagflash::deploy::workspace::{workspace_root, WorkspaceCleaner};
use tagflash::errors::{CommandError, LocateError};
use tagflash::intake::event::Delivery;
use tagflash::intake::signature::sign;
use tagflash::intake::{EventVerifier, Intake, Job};

pub const SECRET: &str = "test-secret";
pub const REPO_URL: &str = "https://git.example.com/acme/blink.git";

pub type Handler = Box<dyn Fn(&CommandSpec) -> Result<CommandOutput, CommandError> + Send + Sync>;

/// Records every command and answers through a handler
pub struct ScriptedRunner {
    calls: Mutex<Vec<CommandSpec>>,
    handler: Handler,
}

impl ScriptedRunner {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput, CommandError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        })
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls whose program is `program`
    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        self.calls.lock().unwrap().push(spec.clone());
        (self.handler)(spec)
    }
}

pub fn exit(code: i32) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        ..Default::default()
    }
}

pub fn stdout(text: &str) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: text.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

/// A git remote and a bench of boards, simulated on the local filesystem.
///
/// `clone` creates the destination, `checkout` records the commit in it, and
/// the flash tool reads that commit back so the timeline shows what was
/// flashed where.
#[derive(Default)]
pub struct FakeWorld {
    /// tag -> commit
    pub tags: HashMap<String, String>,
    /// ports whose upload fails
    pub failing_ports: HashSet<String>,
    /// clone calls that fail before one succeeds
    pub clone_failures: Mutex<u32>,
    /// ordered record of clones and flashes
    pub timeline: Mutex<Vec<String>>,
    /// directory runs place their workspaces in
    pub workspace_root: Option<PathBuf>,
    /// set when a clone started while another workspace still existed
    pub overlapping_clone: Mutex<bool>,
}

const HEAD_FILE: &str = ".fake-head";

impl FakeWorld {
    pub fn with_tags(tags: &[(&str, &str)]) -> Self {
        Self {
            tags: tags
                .iter()
                .map(|(t, c)| (t.to_string(), c.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    /// Flag clones that start while the workspace root under `base` is not empty
    pub fn watching(mut self, base: &Path) -> Self {
        self.workspace_root = Some(workspace_root(base));
        self
    }

    pub fn failing(mut self, port: &str) -> Self {
        self.failing_ports.insert(port.to_string());
        self
    }

    pub fn timeline(&self) -> Vec<String> {
        self.timeline.lock().unwrap().clone()
    }

    pub fn handle(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        match spec.program.as_str() {
            "git" => Ok(self.git(&spec.args)),
            "pio" => Ok(self.flash(spec)),
            other => Err(CommandError::Launch {
                program: other.to_string(),
                reason: "No such file or directory (os error 2)".to_string(),
            }),
        }
    }

    fn git(&self, args: &[String]) -> CommandOutput {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["clone", .., dest] => {
                let dest = Path::new(dest);
                if dest.exists() {
                    return exit(128);
                }
                if let Some(root) = &self.workspace_root {
                    let leftovers = std::fs::read_dir(root).map(|d| d.count()).unwrap_or(0);
                    if leftovers > 0 {
                        *self.overlapping_clone.lock().unwrap() = true;
                    }
                }
                {
                    let mut failures = self.clone_failures.lock().unwrap();
                    if *failures > 0 {
                        *failures -= 1;
                        std::fs::create_dir_all(dest.join(".git")).unwrap();
                        return CommandOutput {
                            code: Some(128),
                            stdout: Vec::new(),
                            stderr: b"fatal: early EOF\n".to_vec(),
                        };
                    }
                }
                std::fs::create_dir_all(dest.join(".git")).unwrap();
                self.timeline.lock().unwrap().push(format!("clone {}", dest.display()));
                exit(0)
            }
            ["-C", dir, "rev-parse", "--verify", "--quiet", rev] => {
                let tag = rev
                    .strip_prefix("refs/tags/")
                    .and_then(|r| r.strip_suffix("^{commit}"))
                    .unwrap_or_default();
                match self.tags.get(tag) {
                    Some(commit) if Path::new(dir).exists() => stdout(&format!("{}\n", commit)),
                    _ => exit(1),
                }
            }
            ["-C", dir, "checkout", "--detach", "--quiet", commit] => {
                std::fs::write(Path::new(dir).join(HEAD_FILE), commit).unwrap();
                exit(0)
            }
            ["-C", dir, "rev-parse", "HEAD"] => {
                match std::fs::read_to_string(Path::new(dir).join(HEAD_FILE)) {
                    Ok(head) => stdout(&head),
                    Err(_) => exit(128),
                }
            }
            _ => exit(129),
        }
    }

    fn flash(&self, spec: &CommandSpec) -> CommandOutput {
        let port = spec.args.last().cloned().unwrap_or_default();
        let head = spec
            .current_dir
            .as_ref()
            .and_then(|dir| std::fs::read_to_string(dir.join(HEAD_FILE)).ok())
            .unwrap_or_else(|| "no-checkout".to_string());
        self.timeline
            .lock()
            .unwrap()
            .push(format!("flash {} {}", head, port));

        if self.failing_ports.contains(&port) {
            CommandOutput {
                code: Some(1),
                stdout: Vec::new(),
                stderr: b"avrdude: stk500_recv(): programmer is not responding\n".to_vec(),
            }
        } else {
            exit(0)
        }
    }
}

/// Fixed device list
pub struct StaticBackend {
    devices: Vec<Device>,
}

impl StaticBackend {
    pub fn new(devices: Vec<Device>) -> Arc<Self> {
        Arc::new(Self { devices })
    }
}

#[async_trait]
impl DeviceBackend for StaticBackend {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn enumerate(&self) -> Result<Vec<Device>, LocateError> {
        Ok(self.devices.clone())
    }
}

pub fn uno(port: &str) -> Device {
    Device {
        identifier: port.to_string(),
        vendor_id: 0x2341,
        product_id: 0x0043,
    }
}

pub fn other_board(port: &str) -> Device {
    Device {
        identifier: port.to_string(),
        vendor_id: 0x1a86,
        product_id: 0x7523,
    }
}

pub fn flash_options(policy: FlashPolicy) -> FlashOptions {
    FlashOptions {
        policy,
        ..Default::default()
    }
}

pub fn pipeline(
    runner: Arc<ScriptedRunner>,
    devices: Vec<Device>,
    policy: FlashPolicy,
    workspace_base: &Path,
) -> DeploymentPipeline {
    DeploymentPipeline::new(
        SourceFetcher::new(runner.clone(), GitOptions::default()),
        DeviceLocator::new(StaticBackend::new(devices), BoardFamily::default()),
        FlashOrchestrator::new(runner, flash_options(policy)),
        WorkspaceCleaner::new(),
        PipelineOptions {
            workspace_base: workspace_base.to_path_buf(),
            ..Default::default()
        },
    )
}

pub fn intake() -> Intake {
    Intake::new(
        EventVerifier::new(SecretString::from(SECRET.to_string())),
        None,
    )
}

pub fn create_payload(ref_type: &str, reference: &str) -> String {
    format!(
        r#"{{"ref":"{reference}","ref_type":"{ref_type}","master_branch":"main","repository":{{"name":"blink","clone_url":"{REPO_URL}"}}}}"#
    )
}

pub fn signed_delivery(kind: &str, body: &str) -> Delivery {
    Delivery {
        body: Bytes::from(body.to_string()),
        signature: Some(sign(SECRET.as_bytes(), body.as_bytes()).unwrap()),
        event_kind: Some(kind.to_string()),
        content_type: Some("application/json".to_string()),
        delivery_id: None,
    }
}

/// An admitted job for `tag`
pub fn tag_job(tag: &str) -> Job {
    intake()
        .admit(&signed_delivery("create", &create_payload("tag", tag)))
        .unwrap()
}

/// An admitted job for `tag` of another repository
pub fn tag_job_for(repository_url: &str, tag: &str) -> Job {
    let body = format!(
        r#"{{"ref":"{tag}","ref_type":"tag","repository":{{"clone_url":"{repository_url}"}}}}"#
    );
    intake().admit(&signed_delivery("create", &body)).unwrap()
}

/// Workspace path runs for [`REPO_URL`] use under `base`
pub fn workspace_dir(base: &Path) -> PathBuf {
    workspace_root(base).join("blink")
}
