//! Time-bounded firmware builds with optional chained flash

use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::artifact_store::ArtifactStore;
use super::build_matrix::{BuildMatrixSnapshot, IDF_DEFAULT_ENV};
use super::flash_executor::FlashExecutor;
use super::patches::resolve_patch;
use super::release::safe_component;
use super::tool_runner::{
    RunContext, ToolCommand, ToolFailure, ToolOutput, ToolRunner, run_with_fallback,
};
use crate::config::ToolsConfig;
use crate::errors::{LabError, Result};
use crate::models::{
    Artifact, ArtifactKind, BuildOutcome, BuildRequest, BuildState, BuildTarget, FlashFollowUp,
    ImageSource, Toolchain, TransferRequest, resolve_timeout,
};
use crate::utils::esptool_utils::clean_message;
use crate::utils::logging::OperationLog;

/// Upper bound for `pio run -t clean`
const CLEAN_TIMEOUT: Duration = Duration::from_secs(120);

/// A request that passed validation, ready to run
#[derive(Debug, Clone)]
pub struct ValidatedBuild {
    pub target: BuildTarget,
    pub env: String,
    pub timeout_secs: u64,
    /// (relative path as requested, absolute path), in application order
    pub patches: Vec<(String, PathBuf)>,
    pub work_dir: PathBuf,
    pub clean: bool,
    pub verbose: bool,
    /// (port, device id) for the chained flash
    pub flash: Option<(String, String)>,
}

/// Why the Running phase stopped early
enum StepError {
    Failed(String),
    TimedOut,
    Lab(LabError),
}

impl From<LabError> for StepError {
    fn from(err: LabError) -> Self {
        StepError::Lab(err)
    }
}

impl From<std::io::Error> for StepError {
    fn from(err: std::io::Error) -> Self {
        StepError::Lab(LabError::Io(err))
    }
}

/// Runs builds for resolved targets and registers their artifacts
pub struct BuildExecutor {
    runner: Arc<dyn ToolRunner>,
    store: Arc<ArtifactStore>,
    flasher: Arc<FlashExecutor>,
    repo_root: PathBuf,
    tools: ToolsConfig,
    git_timeout: Duration,
}

impl BuildExecutor {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        store: Arc<ArtifactStore>,
        flasher: Arc<FlashExecutor>,
        repo_root: PathBuf,
        tools: ToolsConfig,
        git_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            store,
            flasher,
            repo_root,
            tools,
            git_timeout,
        }
    }

    /// Check a request against the snapshot without side effects
    pub fn validate(&self, request: &BuildRequest, snapshot: &BuildMatrixSnapshot) -> Result<ValidatedBuild> {
        let device_id = request.device_id.trim();
        let firmware_id = request.firmware_id.trim();
        if device_id.is_empty() || firmware_id.is_empty() {
            return Err(LabError::Validation("device_id and firmware_id are required".to_string()));
        }
        if request.env_name.trim().is_empty() {
            return Err(LabError::Validation("env_name is required".to_string()));
        }

        let flash = if request.flash_after {
            let port = non_empty(request.port.as_deref())
                .ok_or_else(|| LabError::Validation("flash_after requires a port".to_string()))?;
            let flash_device = non_empty(request.flash_device_id.as_deref()).ok_or_else(|| {
                LabError::Validation("flash_after requires flash_device_id".to_string())
            })?;
            if snapshot.device(flash_device).is_none() {
                return Err(LabError::Validation(format!("Unknown device: {}", flash_device)));
            }
            Some((port.to_string(), flash_device.to_string()))
        } else {
            None
        };

        let target = snapshot
            .target(device_id, firmware_id)
            .cloned()
            .ok_or_else(|| LabError::Validation("Unknown device or firmware".to_string()))?;

        let timeout_secs = resolve_timeout(request.timeout);

        match target.toolchain {
            Toolchain::Idf => {
                let script = self.repo_root.join(&self.tools.idf_build_script);
                if !script.is_file() {
                    return Err(LabError::Validation(format!(
                        "{} not found",
                        self.tools.idf_build_script
                    )));
                }
                if !request.patch_paths.is_empty() {
                    log::warn!("Patches are not applied to IDF builds; ignoring {}", request.patch_paths.len());
                }
                Ok(ValidatedBuild {
                    target,
                    env: IDF_DEFAULT_ENV.to_string(),
                    timeout_secs,
                    patches: Vec::new(),
                    work_dir: self.repo_root.clone(),
                    clean: request.clean,
                    verbose: request.verbose,
                    flash,
                })
            }
            Toolchain::PlatformIo => {
                let requested = request.env_name.trim();
                let env = if target.envs.iter().any(|e| e == requested) {
                    requested.to_string()
                } else {
                    let fallback = target.envs.first().cloned().unwrap_or_default();
                    log::warn!(
                        "Env {} not defined for {}/{}, using {:?}",
                        requested,
                        device_id,
                        firmware_id,
                        fallback
                    );
                    fallback
                };
                if env.is_empty() || env == IDF_DEFAULT_ENV {
                    return Err(LabError::Validation("No build env specified".to_string()));
                }

                let mut work_dir = self.repo_root.join(&target.path);
                if let Some(sub) = target.build_subdir.as_deref() {
                    work_dir = work_dir.join(sub.trim_matches('/'));
                }
                if !work_dir.is_dir() {
                    return Err(LabError::Validation(format!(
                        "Build dir not found: {}",
                        work_dir.display()
                    )));
                }

                let patches = request
                    .patch_paths
                    .iter()
                    .filter(|p| !p.trim().is_empty())
                    .map(|rel| Ok((rel.clone(), resolve_patch(&self.repo_root, &target, rel)?)))
                    .collect::<Result<Vec<_>>>()?;

                Ok(ValidatedBuild {
                    target,
                    env,
                    timeout_secs,
                    patches,
                    work_dir,
                    clean: request.clean,
                    verbose: request.verbose,
                    flash,
                })
            }
        }
    }

    /// Validate, build and optionally flash. `Err` means the request was
    /// rejected before running or a patch did not apply; every other
    /// terminal state is a `BuildOutcome`.
    pub async fn submit(
        &self,
        request: &BuildRequest,
        snapshot: &BuildMatrixSnapshot,
        lines: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<BuildOutcome> {
        let mut state = BuildState::Pending;
        let build = self.validate(request, snapshot)?;
        let oplog = OperationLog::new(lines.clone());
        let ctx = RunContext {
            cancel: None,
            lines,
        };

        transition(&mut state, BuildState::Running, &build);
        oplog.info(format!(
            "🏗️  Building {}/{} (env {}, timeout {}s)",
            build.target.device_id, build.target.firmware_id, build.env, build.timeout_secs
        ));

        let deadline = Instant::now() + Duration::from_secs(build.timeout_secs);
        let result = match build.target.toolchain {
            Toolchain::PlatformIo => self.run_platformio(&build, deadline, &ctx, &oplog).await,
            Toolchain::Idf => self.run_idf(&build, deadline, &ctx).await,
        };

        let artifact = match result {
            Ok(artifact) => artifact,
            Err(StepError::TimedOut) => {
                transition(&mut state, BuildState::TimedOut, &build);
                oplog.error(format!("⏱️  Build timed out after {}s", build.timeout_secs));
                return Ok(BuildOutcome::TimedOut {
                    seconds: build.timeout_secs,
                });
            }
            Err(StepError::Failed(error)) => {
                transition(&mut state, BuildState::Failed, &build);
                oplog.error(format!("❌ Build failed: {}", error));
                return Ok(BuildOutcome::Failed { error });
            }
            Err(StepError::Lab(err)) => {
                transition(&mut state, BuildState::Failed, &build);
                oplog.error(format!("❌ {}", err));
                return match err {
                    LabError::PatchConflict { .. } => Err(err),
                    other => Ok(BuildOutcome::Failed {
                        error: other.to_string(),
                    }),
                };
            }
        };

        transition(&mut state, BuildState::Succeeded, &build);
        oplog.info(format!("✅ Build succeeded: {}", artifact.path));

        let flash = match &build.flash {
            None => FlashFollowUp::NotRequested,
            Some((port, device_id)) => {
                oplog.info(format!("📡 Flashing {} to {} on {}", artifact.path, device_id, port));
                let transfer = TransferRequest {
                    port: port.clone(),
                    device_id: device_id.clone(),
                    source: ImageSource::ArtifactPath(artifact.path.clone()),
                    addr: None,
                };
                match self.flasher.flash(transfer, snapshot).await {
                    Ok(report) => {
                        oplog.info(format!("✅ {}", report.message));
                        FlashFollowUp::Flashed {
                            message: report.message,
                        }
                    }
                    Err(e) => {
                        oplog.warning(format!("⚠️ Build succeeded but flash failed: {}", e));
                        FlashFollowUp::Failed { error: e.to_string() }
                    }
                }
            }
        };

        Ok(BuildOutcome::Succeeded { artifact, flash })
    }

    async fn run_platformio(
        &self,
        build: &ValidatedBuild,
        deadline: Instant,
        ctx: &RunContext,
        oplog: &OperationLog,
    ) -> std::result::Result<Artifact, StepError> {
        let touched_tree = !build.patches.is_empty();
        let outcome = self.platformio_steps(build, deadline, ctx, oplog).await;

        if touched_tree {
            // Always leave the source tree as checked out
            let revert = ToolCommand::new(self.tools.git.as_str())
                .args(["checkout", "-f", "."])
                .current_dir(&build.work_dir);
            match self.runner.run(&revert, self.git_timeout, &RunContext::default()).await {
                Ok(out) if out.success => oplog.debug("Reverted work tree"),
                Ok(out) => log::error!("Failed to revert work tree: {}", clean_message(&out.output)),
                Err(e) => log::error!("Failed to revert work tree: {}", e),
            }
        }
        outcome
    }

    async fn platformio_steps(
        &self,
        build: &ValidatedBuild,
        deadline: Instant,
        ctx: &RunContext,
        oplog: &OperationLog,
    ) -> std::result::Result<Artifact, StepError> {
        if !build.patches.is_empty() {
            let reset = ToolCommand::new(self.tools.git.as_str())
                .args(["checkout", "-f", "."])
                .current_dir(&build.work_dir);
            let out = self.git_step(&reset, deadline).await?;
            if !out.success {
                return Err(StepError::Failed(format!(
                    "git checkout failed: {}",
                    clean_message(&out.output)
                )));
            }

            for (relative, absolute) in &build.patches {
                oplog.info(format!("🩹 Applying {}", relative));
                let apply = ToolCommand::new(self.tools.git.as_str())
                    .args(["apply", "-p1", "--verbose"])
                    .current_dir(&build.work_dir)
                    .stdin_from(absolute);
                let out = self.git_step(&apply, deadline).await?;
                if !out.success {
                    return Err(StepError::Lab(LabError::PatchConflict {
                        patch: relative.clone(),
                        detail: clean_message(&out.output),
                    }));
                }
            }
        }

        if build.clean {
            oplog.info(format!("🧹 Cleaning env {}", build.env));
            let clean = ToolCommand::new("pio")
                .args(["run", "-t", "clean", "-e", build.env.as_str()])
                .current_dir(&build.work_dir);
            let limit = remaining(deadline)?.min(CLEAN_TIMEOUT);
            match run_with_fallback(self.runner.as_ref(), &self.tools.platformio, &clean, limit, ctx).await {
                Ok(out) if !out.success => log::warn!("Clean failed: {}", clean_message(&out.output)),
                Ok(_) => {}
                Err(ToolFailure::TimedOut(_)) if remaining(deadline).is_err() => return Err(StepError::TimedOut),
                Err(e) => log::warn!("Clean step skipped: {}", e),
            }
        }

        let mut command = ToolCommand::new("pio")
            .args(["run", "-e", build.env.as_str()])
            .current_dir(&build.work_dir);
        if build.verbose {
            command = command.arg("-v");
        }
        oplog.debug(&format!("Running {}", command.display()));

        let out = match run_with_fallback(
            self.runner.as_ref(),
            &self.tools.platformio,
            &command,
            remaining(deadline)?,
            ctx,
        )
        .await
        {
            Ok(out) => out,
            Err(ToolFailure::TimedOut(_)) => return Err(StepError::TimedOut),
            Err(ToolFailure::NotFound(_)) => {
                return Err(StepError::Failed("PlatformIO not found (pip install platformio)".to_string()));
            }
            Err(e) => return Err(StepError::Failed(e.to_string())),
        };
        if !out.success {
            let detail = clean_message(&out.output);
            return Err(StepError::Failed(if detail.is_empty() {
                "Build failed".to_string()
            } else {
                detail
            }));
        }

        let built = build
            .work_dir
            .join(".pio")
            .join("build")
            .join(&build.env)
            .join("firmware.bin");
        if !built.is_file() {
            return Err(StepError::Failed(format!(
                "Build succeeded but firmware.bin not found in .pio/build/{}",
                build.env
            )));
        }

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let dest_dir = self
            .store
            .artifacts_dir()
            .join(&build.target.device_id)
            .join(&build.target.firmware_id)
            .join(format!("build_{}_{}", safe_component(&build.env), stamp));
        tokio::fs::create_dir_all(&dest_dir).await?;
        let dest = dest_dir.join("firmware.bin");
        tokio::fs::copy(&built, &dest).await?;

        Ok(self.store.register(&dest, "firmware.bin", ArtifactKind::Artifact)?)
    }

    async fn run_idf(
        &self,
        build: &ValidatedBuild,
        deadline: Instant,
        ctx: &RunContext,
    ) -> std::result::Result<Artifact, StepError> {
        let script = self.repo_root.join(&self.tools.idf_build_script);
        let command = ToolCommand::new(script.to_string_lossy())
            .args([build.target.device_id.as_str(), build.target.firmware_id.as_str(), ""])
            .current_dir(&self.repo_root);

        let out = match self.runner.run(&command, remaining(deadline)?, ctx).await {
            Ok(out) => out,
            Err(ToolFailure::TimedOut(_)) => return Err(StepError::TimedOut),
            Err(e) => return Err(StepError::Failed(e.to_string())),
        };
        if !out.success {
            let detail = clean_message(&out.output);
            return Err(StepError::Failed(if detail.is_empty() {
                "IDF build failed".to_string()
            } else {
                detail
            }));
        }

        let built = self
            .store
            .artifacts_dir()
            .join(&build.target.device_id)
            .join(&build.target.firmware_id)
            .join(Local::now().format("%Y-%m-%d").to_string())
            .join("firmware.bin");
        if !built.is_file() {
            return Err(StepError::Failed(format!(
                "IDF build finished but {} is missing",
                self.store.relative(&built)
            )));
        }
        Ok(self.store.register(&built, "firmware.bin", ArtifactKind::Artifact)?)
    }

    /// Run a git step bounded by both the git limit and the build deadline
    async fn git_step(
        &self,
        command: &ToolCommand,
        deadline: Instant,
    ) -> std::result::Result<ToolOutput, StepError> {
        let left = remaining(deadline)?;
        match self.runner.run(command, left.min(self.git_timeout), &RunContext::default()).await {
            Ok(out) => Ok(out),
            Err(ToolFailure::TimedOut(_)) if left <= self.git_timeout => Err(StepError::TimedOut),
            Err(e) => Err(StepError::Failed(format!("{} failed: {}", command.display(), e))),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }
}

fn remaining(deadline: Instant) -> std::result::Result<Duration, StepError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(StepError::TimedOut)
    } else {
        Ok(left)
    }
}

fn transition(state: &mut BuildState, next: BuildState, build: &ValidatedBuild) {
    if !state.can_transition_to(next) {
        log::error!("Illegal build transition {:?} -> {:?}", state, next);
        return;
    }
    log::info!(
        "Build {}/{} [{}]: {:?} -> {:?}",
        build.target.device_id,
        build.target.firmware_id,
        build.env,
        state,
        next
    );
    *state = next;
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
