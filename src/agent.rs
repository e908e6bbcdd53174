//! The collection loop: negotiate a request, capture it, build the symbol
//! tree, convert, report, and start over.

use crate::cloudprofilerpb::{Deployment, Profile, ProfileType};
use crate::command::{requested_duration, CommandTemplate};
use crate::config::{AgentConfig, RunMode};
use crate::converter::FormatConverter;
use crate::errors::{AgentError, SymbolizeError};
use crate::negotiator::{RequestNegotiator, Sleeper};
use crate::remote::ProfilerApi;
use crate::reporter::UploadReporter;
use crate::sampling::{SamplingRunner, TerminationPolicy};
use crate::symbol_tree::SymbolResolver;
use anyhow::Context;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Subdirectory of the working directory holding the build-id tree.
pub const SYMBOL_DIR: &str = "symbols";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Negotiating,
    Capturing,
    Symbolizing,
    Converting,
    Reporting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Negotiating => "negotiating",
            Phase::Capturing => "capturing",
            Phase::Symbolizing => "symbolizing",
            Phase::Converting => "converting",
            Phase::Reporting => "reporting",
        };
        f.write_str(name)
    }
}

/// Where captures and symbol trees are written. A temporary directory is
/// removed when the agent exits.
#[derive(Debug)]
pub enum WorkDir {
    Temp(TempDir),
    Fixed(PathBuf),
}

impl WorkDir {
    pub fn create(dir: Option<PathBuf>) -> anyhow::Result<Self> {
        match dir {
            Some(dir) => {
                fs::create_dir_all(&dir).with_context(|| {
                    format!("failed to create working directory {}", dir.display())
                })?;
                Ok(WorkDir::Fixed(dir))
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("perfagent-")
                    .tempdir()
                    .context("failed to create temporary working directory")?;
                Ok(WorkDir::Temp(dir))
            }
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            WorkDir::Temp(dir) => dir.path(),
            WorkDir::Fixed(dir) => dir,
        }
    }
}

/// Mutable state threaded through every iteration.
pub struct RuntimeState<C> {
    pub client: C,
    pub workdir: WorkDir,
}

pub struct CollectionLoop<S> {
    deployment: Deployment,
    mode: RunMode,
    negotiator: RequestNegotiator<S>,
    sampling: BTreeMap<ProfileType, CommandTemplate>,
    capture_file: PathBuf,
    termination: TerminationPolicy,
    stderr_limit: usize,
    resolver: SymbolResolver,
    converter: FormatConverter,
    reporter: UploadReporter,
}

impl<S: Sleeper> CollectionLoop<S> {
    pub fn new(config: AgentConfig, sleeper: S) -> Self {
        Self {
            deployment: config.deployment,
            mode: config.mode,
            negotiator: RequestNegotiator::new(
                config.retry,
                sleeper,
                config.sampling.keys().copied().collect(),
            ),
            sampling: config.sampling,
            capture_file: config.capture_file,
            termination: config.termination,
            stderr_limit: config.stderr_limit,
            resolver: config.resolver,
            converter: config.converter,
            reporter: UploadReporter,
        }
    }

    /// Loops until negotiation fails for good, the service asks for a kind
    /// of profile this agent cannot take, or (strict mode) a capture fails.
    /// Returns after one iteration in once mode.
    pub async fn run<C: ProfilerApi>(&self, state: &mut RuntimeState<C>) -> Result<(), AgentError> {
        log::info!(
            "collecting profiles for {}/{} in {:?} mode",
            self.deployment.project_id,
            self.deployment.target,
            self.mode
        );
        loop {
            match self.run_iteration(state).await {
                Ok(()) => {}
                Err(e) if e.is_pipeline_failure() && self.mode != RunMode::Strict => {
                    log::error!("dropping profile: {}", e);
                }
                Err(e) => return Err(e),
            }
            if self.mode == RunMode::Once {
                return Ok(());
            }
        }
    }

    pub async fn run_iteration<C: ProfilerApi>(
        &self,
        state: &mut RuntimeState<C>,
    ) -> Result<(), AgentError> {
        enter(Phase::Negotiating);
        let mut profile = self
            .negotiator
            .negotiate(&mut state.client, &self.deployment)
            .await?;
        let template = self.template_for(&profile)?;

        enter(Phase::Capturing);
        let runner = SamplingRunner::new(
            state.workdir.path(),
            &self.capture_file,
            self.termination.clone(),
            self.stderr_limit,
        );
        remove_stale_capture(&runner.capture_path());
        let command = template.instantiate(&profile);
        let capture = runner.run(&command, requested_duration(&profile)).await?;
        log::info!(
            "sampler {:?}, capture at {}",
            capture.termination,
            capture.path.display()
        );

        enter(Phase::Symbolizing);
        let symbol_dir = state.workdir.path().join(SYMBOL_DIR);
        reset_dir(&symbol_dir)?;
        let linked = self.resolver.build_lookup_tree(&symbol_dir, &capture.path).await?;
        log::info!("linked {} binaries under {}", linked, symbol_dir.display());

        enter(Phase::Converting);
        let artifact = self.converter.convert(&capture.path, &symbol_dir).await?;
        profile.profile_bytes = artifact.bytes;

        enter(Phase::Reporting);
        self.reporter.report(&mut state.client, profile).await;
        Ok(())
    }

    /// The sampling command configured for the kind of profile requested.
    fn template_for(&self, profile: &Profile) -> Result<&CommandTemplate, AgentError> {
        match ProfileType::try_from(profile.profile_type) {
            Ok(kind) => self.sampling.get(&kind).ok_or_else(|| {
                AgentError::UnsupportedProfileType(kind.as_str_name().to_string())
            }),
            Err(_) => Err(AgentError::UnsupportedProfileType(
                profile.profile_type.to_string(),
            )),
        }
    }
}

fn enter(phase: Phase) {
    log::info!("entering phase {}", phase);
}

fn remove_stale_capture(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::debug!("removed stale capture {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("could not remove stale capture {}: {}", path.display(), e),
    }
}

fn reset_dir(dir: &Path) -> Result<(), SymbolizeError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SymbolizeError::Io {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprofilerpb::UpdateProfileRequest;
    use crate::credentials::CredentialsSource;
    use crate::errors::{CaptureError, NegotiationError};
    use crate::negotiator::RetryPolicy;
    use crate::subprocess::{ToolCommand, DEFAULT_STDERR_LIMIT};
    use crate::testing::{cpu_profile, deployment, profile, RecordingSleeper, ScriptedApi};
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tonic::{Code, Status};

    const BUILD_ID: &str = "0123456789abcdef0123456789abcdef01234567";

    fn config(mode: RunMode, sampling: &[&str]) -> AgentConfig {
        let listing = format!("echo {} /nonexistent/bin/app", BUILD_ID);
        AgentConfig {
            api: "localhost:0".into(),
            insecure: true,
            credentials: CredentialsSource::Anonymous,
            deployment: deployment(),
            mode,
            workdir: None,
            sampling: BTreeMap::from([(ProfileType::Cpu, template(sampling))]),
            capture_file: PathBuf::from("perf.data"),
            resolver: SymbolResolver::new(
                ToolCommand::new("sh", ["-c", listing.as_str()]),
                DEFAULT_STDERR_LIMIT,
            ),
            converter: FormatConverter::new(
                ToolCommand::new("cat", Vec::<String>::new()),
                "PPROF_BINARY_PATH",
                DEFAULT_STDERR_LIMIT,
            ),
            termination: TerminationPolicy::default(),
            retry: RetryPolicy::default(),
            stderr_limit: DEFAULT_STDERR_LIMIT,
        }
    }

    fn template(argv: &[&str]) -> CommandTemplate {
        CommandTemplate::new(argv.iter().map(|s| s.to_string()).collect()).unwrap()
    }

    fn state(api: ScriptedApi) -> RuntimeState<ScriptedApi> {
        RuntimeState {
            client: api,
            workdir: WorkDir::create(None).unwrap(),
        }
    }

    fn gunzip(update: &UpdateProfileRequest) -> String {
        let bytes = &update.profile.as_ref().unwrap().profile_bytes;
        let mut text = String::new();
        GzDecoder::new(bytes.as_slice()).read_to_string(&mut text).unwrap();
        text
    }

    const WRITES_CAPTURE: &[&str] = &[
        "sh",
        "-c",
        "printf 'samples for {{ .Duration.Seconds }}s' > perf.data",
    ];
    const FAILS: &[&str] = &["sh", "-c", "echo 'no access to perf events' >&2; exit 3"];

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::Negotiating.to_string(), "negotiating");
        assert_eq!(Phase::Reporting.to_string(), "reporting");
    }

    #[tokio::test]
    async fn test_once_uploads_converted_profile() {
        let agent = CollectionLoop::new(
            config(RunMode::Once, WRITES_CAPTURE),
            RecordingSleeper::default(),
        );
        let mut state = state(ScriptedApi::new(vec![Ok(cpu_profile(
            "projects/test-project/profiles/1",
            7,
        ))]));

        agent.run(&mut state).await.unwrap();

        assert_eq!(state.client.creates.len(), 1);
        assert_eq!(state.client.updates.len(), 1);
        let update = &state.client.updates[0];
        assert_eq!(
            update.profile.as_ref().unwrap().name,
            "projects/test-project/profiles/1"
        );
        assert_eq!(gunzip(update), "samples for 7s");

        let link = state.workdir.path().join(SYMBOL_DIR).join(BUILD_ID).join("app");
        assert_eq!(fs::read_link(link).unwrap(), PathBuf::from("/nonexistent/bin/app"));
    }

    #[tokio::test]
    async fn test_once_failure_is_not_fatal() {
        let agent = CollectionLoop::new(config(RunMode::Once, FAILS), RecordingSleeper::default());
        let mut state = state(ScriptedApi::new(vec![Ok(cpu_profile("p", 1))]));

        agent.run(&mut state).await.unwrap();

        assert_eq!(state.client.creates.len(), 1);
        assert!(state.client.updates.is_empty());
    }

    #[tokio::test]
    async fn test_strict_capture_failure_is_fatal() {
        let agent =
            CollectionLoop::new(config(RunMode::Strict, FAILS), RecordingSleeper::default());
        let mut state = state(ScriptedApi::new(vec![
            Ok(cpu_profile("p", 1)),
            Ok(cpu_profile("q", 1)),
        ]));

        let err = agent.run(&mut state).await.unwrap_err();

        match err {
            AgentError::Capture(CaptureError::Failed { stderr, .. }) => {
                assert_eq!(stderr, "no access to perf events");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(state.client.creates.len(), 1);
        assert!(state.client.updates.is_empty());
    }

    #[tokio::test]
    async fn test_continuous_drops_failed_profiles() {
        let agent = CollectionLoop::new(
            config(RunMode::Continuous, FAILS),
            RecordingSleeper::default(),
        );
        let mut state = state(ScriptedApi::new(vec![
            Ok(cpu_profile("p", 1)),
            Ok(cpu_profile("q", 1)),
        ]));

        // both requests are dropped, then the exhausted script rejects
        let err = agent.run(&mut state).await.unwrap_err();

        assert!(matches!(
            err,
            AgentError::Negotiation(NegotiationError::Rejected(ref s))
                if s.code() == Code::PermissionDenied
        ));
        assert_eq!(state.client.creates.len(), 3);
        assert!(state.client.updates.is_empty());
    }

    #[tokio::test]
    async fn test_continuous_uploads_until_rejected() {
        let agent = CollectionLoop::new(
            config(RunMode::Continuous, WRITES_CAPTURE),
            RecordingSleeper::default(),
        );
        let mut state = state(ScriptedApi::new(vec![
            Ok(cpu_profile("p", 1)),
            Err(Status::unavailable("blip")),
            Ok(cpu_profile("q", 2)),
        ]));

        agent.run(&mut state).await.unwrap_err();

        let uploaded: Vec<String> = state.client.updates.iter().map(gunzip).collect();
        assert_eq!(uploaded, vec!["samples for 1s", "samples for 2s"]);
    }

    #[tokio::test]
    async fn test_unsupported_profile_type_is_fatal() {
        let agent = CollectionLoop::new(
            config(RunMode::Continuous, WRITES_CAPTURE),
            RecordingSleeper::default(),
        );
        let mut state = state(ScriptedApi::new(vec![Ok(profile("p", ProfileType::Heap, 10))]));

        let err = agent.run(&mut state).await.unwrap_err();

        assert!(matches!(err, AgentError::UnsupportedProfileType(ref kind) if kind == "HEAP"));
        assert!(state.client.updates.is_empty());
    }

    #[tokio::test]
    async fn test_heap_request_uses_its_own_command() {
        let mut config = config(RunMode::Once, WRITES_CAPTURE);
        config.sampling.insert(
            ProfileType::Heap,
            template(&["sh", "-c", "printf 'heap samples' > perf.data"]),
        );
        let agent = CollectionLoop::new(config, RecordingSleeper::default());
        let mut state = state(ScriptedApi::new(vec![Ok(profile("h", ProfileType::Heap, 5))]));

        agent.run(&mut state).await.unwrap();

        assert_eq!(
            state.client.creates[0].profile_type,
            vec![ProfileType::Cpu as i32, ProfileType::Heap as i32]
        );
        assert_eq!(state.client.updates.len(), 1);
        assert_eq!(gunzip(&state.client.updates[0]), "heap samples");
    }

    #[tokio::test]
    async fn test_stale_capture_is_not_reused() {
        let agent =
            CollectionLoop::new(config(RunMode::Strict, &["true"]), RecordingSleeper::default());
        let mut state = state(ScriptedApi::new(vec![Ok(cpu_profile("p", 1))]));
        fs::write(state.workdir.path().join("perf.data"), b"old").unwrap();

        let err = agent.run(&mut state).await.unwrap_err();

        assert!(matches!(err, AgentError::Capture(CaptureError::MissingCapture { .. })));
    }
}
