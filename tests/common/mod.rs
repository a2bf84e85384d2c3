// tests/common/mod.rs

//! Shared fixtures for the integration tests: a recording host and a
//! throwaway node rooted in a temp directory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use owehost::config::{HostConfig, PathsConfig};
use owehost::host::{CommandOutput, HostError, HostOps};
use owehost::model::{AccountState, DesiredState, Identity, Limits, Plan};
use owehost::service::Components;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const ACTOR: &str = "admin";

/// Host that records every command instead of running it. Users created via
/// `useradd` become visible to `id` and `id -nu`; `openssl req` copies the
/// fixture pair.
#[derive(Debug, Default)]
pub struct FakeHost {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    users: Mutex<HashMap<String, u32>>,
    failures: Mutex<HashMap<String, i32>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later run of `program` exit with `code`
    pub fn fail(&self, program: &str, code: i32) {
        self.failures.lock().unwrap().insert(program.to_string(), code);
    }

    /// Undoes [`FakeHost::fail`]
    pub fn recover(&self, program: &str) {
        self.failures.lock().unwrap().remove(program);
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|(p, _)| p == program)
            .map(|(_, args)| args)
            .collect()
    }

    pub fn user_uid(&self, name: &str) -> Option<u32> {
        self.users.lock().unwrap().get(name).copied()
    }

    fn name_of(&self, uid: u32) -> Option<String> {
        self.users
            .lock()
            .unwrap()
            .iter()
            .find(|(_, u)| **u == uid)
            .map(|(name, _)| name.clone())
    }
}

fn exit(code: i32) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        ..CommandOutput::default()
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

#[async_trait]
impl HostOps for FakeHost {
    async fn run(&self, program: &str, args: Vec<String>) -> Result<CommandOutput, HostError> {
        self.calls.lock().unwrap().push((program.to_string(), args.clone()));

        if let Some(code) = self.failures.lock().unwrap().get(program) {
            return Ok(CommandOutput {
                code: Some(*code),
                stderr: format!("{} failed", program),
                ..CommandOutput::default()
            });
        }

        let output = match program {
            "id" => {
                let uid = args.last().and_then(|uid| uid.parse().ok());
                match uid.and_then(|uid| self.name_of(uid)) {
                    Some(name) if args.first().map(String::as_str) == Some("-nu") => CommandOutput {
                        code: Some(0),
                        stdout: format!("{}\n", name),
                        ..CommandOutput::default()
                    },
                    Some(_) => exit(0),
                    None => exit(1),
                }
            }
            "useradd" => {
                let uid = flag_value(&args, "--uid").and_then(|u| u.parse().ok());
                if let (Some(uid), Some(name)) = (uid, args.last()) {
                    self.users.lock().unwrap().insert(name.clone(), uid);
                }
                exit(0)
            }
            "userdel" => {
                if let Some(name) = args.first() {
                    self.users.lock().unwrap().remove(name);
                }
                exit(0)
            }
            "openssl" => {
                let key = flag_value(&args, "-keyout").map(PathBuf::from);
                let cert = flag_value(&args, "-out").map(PathBuf::from);
                if let (Some(key), Some(cert)) = (key, cert) {
                    fs::copy(fixture("acme.test.key"), key).expect("copy key fixture");
                    fs::copy(fixture("acme.test.crt"), cert).expect("copy cert fixture");
                }
                exit(0)
            }
            _ => exit(0),
        };
        Ok(output)
    }

    fn chown(&self, _path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> io::Result<()> {
        Ok(())
    }
}

/// A node whose every root lives under one temp directory
pub struct Sandbox {
    pub dir: TempDir,
    pub config: HostConfig,
    pub host: Arc<FakeHost>,
    pub components: Components,
    pub token: CancellationToken,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = HostConfig {
            paths: PathsConfig::under(dir.path()),
            node_id: "node-1".to_string(),
            ..HostConfig::default()
        };
        let host = Arc::new(FakeHost::new());
        let components = Components::build(&config, host.clone()).expect("components");
        Self {
            dir,
            config,
            host,
            components,
            token: CancellationToken::new(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Path of an absolute node path re-rooted into the sandbox
    pub fn path(&self, absolute: &str) -> PathBuf {
        self.root().join(absolute.trim_start_matches('/'))
    }

    /// Creates tenant `id` named `name` on the starter plan
    pub async fn create_tenant(&self, id: u32, name: &str) -> Identity {
        let desired = desired(id, name);
        self.components
            .applier
            .apply(id, &desired, ACTOR, &self.token)
            .await
            .expect("apply");
        self.components.store.read_identity(id).expect("identity")
    }
}

pub fn desired(id: u32, name: &str) -> DesiredState {
    let mut identity = Identity::new(id, name, ACTOR, Plan::Starter);
    identity.state = AccountState::Active;
    DesiredState {
        identity: Some(identity),
        limits: Some(Limits::preset(Plan::Starter)),
        ..DesiredState::default()
    }
}
