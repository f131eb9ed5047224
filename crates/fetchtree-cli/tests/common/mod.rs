#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;

use wait_timeout::ChildExt;

pub struct TestContext {
    _temp: TempDir,
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub config_dir: PathBuf,
    pub cli_bin: PathBuf,
}

impl TestContext {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let source_dir = temp.path().join("source");
        let output_dir = temp.path().join("output");
        let config_dir = temp.path().join("config");
        std::fs::create_dir_all(&source_dir).expect("source dir");
        std::fs::create_dir_all(&config_dir).expect("config dir");

        Self {
            _temp: temp,
            source_dir,
            output_dir,
            config_dir,
            cli_bin: PathBuf::from(env!("CARGO_BIN_EXE_fetchtree")),
        }
    }

    pub fn write_source(&self, rel: &str, contents: &[u8]) {
        let path = self.source_dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(path, contents).expect("write source file");
    }

    /// A `fetchtree` command pinned to this context's config directory.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.cli_bin);
        cmd.arg("--config-dir").arg(&self.config_dir);
        cmd.env_remove("RUST_LOG");
        cmd
    }

    pub fn fetch_command(&self, source: &Path) -> Command {
        let mut cmd = self.command();
        cmd.arg("fetch")
            .arg(source)
            .arg(&self.output_dir)
            .arg("--workers")
            .arg("4")
            .arg("--chunk-workers")
            .arg("2")
            .arg("--wait-interval")
            .arg("1");
        cmd
    }
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> std::process::Output {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn().expect("spawn command");

    match child.wait_timeout(timeout).expect("wait for process") {
        Some(_status) => child
            .wait_with_output()
            .expect("collect command output after completion"),
        None => {
            let _ = child.kill();
            let output = child
                .wait_with_output()
                .expect("collect output after killing command");
            panic!(
                "command timed out after {:?}\nstdout:\n{}\nstderr:\n{}",
                timeout,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        }
    }
}
