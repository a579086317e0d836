//! Scripted stand-ins for esptool, PlatformIO and git
//!
//! Tests describe how each external tool behaves with a closure over the
//! command line; the runner records every invocation so tests can assert on
//! what was (or was not) executed.

#![allow(dead_code)]

use async_trait::async_trait;
use labflash::models::Port;
use labflash::services::PortSource;
use labflash::services::tool_runner::{
    RunContext, ToolCommand, ToolFailure, ToolOutput, ToolRunner,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// ESP image header byte for esp32s3 builds
pub const ESP32S3_CHIP_ID: u8 = 9;
/// ESP image header byte for classic esp32 builds
pub const ESP32_CHIP_ID: u8 = 0;

/// How a scripted tool responds to one invocation
pub enum Reply {
    Output(ToolOutput),
    Failure(ToolFailure),
    /// Finish after a delay; exceeding the caller's timeout is a timeout
    After(Duration, ToolOutput),
    /// Never finish on its own
    Hang,
}

impl Reply {
    pub fn ok(output: &str) -> Self {
        Reply::Output(ToolOutput::ok(output))
    }

    pub fn fail(code: i32, output: &str) -> Self {
        Reply::Output(ToolOutput::failed(code, output))
    }
}

type Script = dyn Fn(&ToolCommand) -> Reply + Send + Sync;

pub struct ScriptedRunner {
    script: Box<Script>,
    calls: Mutex<Vec<ToolCommand>>,
}

impl ScriptedRunner {
    pub fn new(script: impl Fn(&ToolCommand) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every tool succeeds with empty output
    pub fn permissive() -> Self {
        Self::new(|_| Reply::ok(""))
    }

    pub fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().unwrap().clone()
    }

    /// Invocations whose arguments include `word`
    pub fn calls_with(&self, word: &str) -> Vec<ToolCommand> {
        self.calls()
            .into_iter()
            .filter(|c| c.args.iter().any(|a| a == word))
            .collect()
    }
}

#[async_trait]
impl ToolRunner for ScriptedRunner {
    async fn run(
        &self,
        command: &ToolCommand,
        timeout: Duration,
        ctx: &RunContext,
    ) -> Result<ToolOutput, ToolFailure> {
        self.calls.lock().unwrap().push(command.clone());
        if ctx.is_cancelled() {
            return Err(ToolFailure::Cancelled);
        }

        let output = match (self.script)(command) {
            Reply::Output(out) => out,
            Reply::Failure(failure) => return Err(failure),
            Reply::After(delay, out) => {
                if delay >= timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(ToolFailure::TimedOut(timeout));
                }
                tokio::time::sleep(delay).await;
                out
            }
            Reply::Hang => {
                tokio::time::sleep(timeout).await;
                return Err(ToolFailure::TimedOut(timeout));
            }
        };
        for line in output.output.lines() {
            ctx.emit(line);
        }
        Ok(output)
    }
}

/// Fixed enumeration result
pub struct FakePorts(pub Result<Vec<Port>, String>);

impl FakePorts {
    pub fn none() -> Self {
        FakePorts(Ok(Vec::new()))
    }

    pub fn named(names: &[&str]) -> Self {
        FakePorts(Ok(names.iter().map(|n| Port::new(*n, "USB JTAG/serial debug unit")).collect()))
    }
}

impl PortSource for FakePorts {
    fn enumerate(&self) -> Result<Vec<Port>, String> {
        self.0.clone()
    }
}

/// A minimal ESP application image header for `chip_id`, padded to `len`
pub fn esp_image(chip_id: u8, len: usize) -> Vec<u8> {
    let mut image = vec![0u8; len.max(64)];
    image[0] = 0xE9;
    image[12] = chip_id;
    image
}

pub fn arg_after<'a>(command: &'a ToolCommand, flag: &str) -> Option<&'a str> {
    let index = command.args.iter().position(|a| a == flag)?;
    command.args.get(index + 1).map(String::as_str)
}

/// Behave like `esptool read-flash <offset> <len> <file>`: write `len`
/// bytes of erased flash to the target file
pub fn fake_read_flash(command: &ToolCommand) -> Reply {
    let Some(index) = command.args.iter().position(|a| a == "read-flash") else {
        return Reply::fail(2, "unexpected esptool command");
    };
    let len: usize = command.args[index + 2].parse().unwrap();
    let path = PathBuf::from(&command.args[index + 3]);
    std::fs::write(&path, vec![0xFF; len]).unwrap();
    Reply::ok("Read 0 bytes at 0x00000000 in 0.1 seconds")
}

/// Behave like `pio run -e <env>`: drop a firmware.bin into the env build dir
pub fn fake_pio_build(command: &ToolCommand) -> Reply {
    let env = arg_after(command, "-e").unwrap_or("default").to_string();
    let cwd = command.cwd.clone().unwrap_or_else(|| Path::new(".").to_path_buf());
    let out_dir = cwd.join(".pio").join("build").join(&env);
    std::fs::create_dir_all(&out_dir).unwrap();
    std::fs::write(out_dir.join("firmware.bin"), esp_image(ESP32S3_CHIP_ID, 4096)).unwrap();
    Reply::ok(&format!("Processing {}\nBuilding .pio/build/{}/firmware.bin\n========== [SUCCESS] ==========", env, env))
}

pub fn is_pio(command: &ToolCommand) -> bool {
    command.program == "pio" || command.program == "platformio"
}

pub fn is_git(command: &ToolCommand) -> bool {
    command.program == "git"
}
