//! Common test utilities for Warden CLI tests
#![allow(dead_code)]

use assert_cmd::Command;
use std::path::PathBuf;
use tempfile::{tempdir, TempDir};

use warden_provider::Message;
use warden_session::SessionRecord;

/// Isolated HOME so ~/.warden never touches the real one
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub data_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempdir()?;
        let data_dir = temp_dir.path().join(".warden");
        Ok(Self { temp_dir, data_dir })
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Command with HOME pointed at the test environment
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_warden"));
        cmd.env("HOME", self.temp_dir.path());
        cmd.env_remove("RUST_LOG");
        cmd
    }

    /// Write a session document the way the file store does
    pub fn write_session(&self, id: &str, messages: Vec<Message>) -> anyhow::Result<()> {
        let mut record = SessionRecord::new(id);
        record.messages = messages;
        std::fs::create_dir_all(self.sessions_dir())?;
        std::fs::write(
            self.sessions_dir().join(format!("{}.json", id)),
            serde_json::to_string_pretty(&record)?,
        )?;
        Ok(())
    }

    pub fn write_file(&self, name: &str, content: &str) -> anyhow::Result<PathBuf> {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, content)?;
        Ok(path)
    }
}
