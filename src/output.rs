use std::io::{self, Write};

use serde::Serialize;

use crate::app::{CheckResult, ContainersResult, RunResult};
use crate::domain::ProcessingStatus;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_status(status: &ProcessingStatus) -> io::Result<()> {
        Self::print_json(status)
    }

    pub fn print_check(result: &CheckResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_containers(result: &ContainersResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_run(result: &RunResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
