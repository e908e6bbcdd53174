//! Command line and the immutable agent configuration built from it.

use crate::cloudprofilerpb::{Deployment, ProfileType};
use crate::command::CommandTemplate;
use crate::converter::FormatConverter;
use crate::credentials::{self, CredentialsSource};
use crate::negotiator::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::sampling::TerminationPolicy;
use crate::subprocess::DEFAULT_STDERR_LIMIT;
use crate::symbol_tree::SymbolResolver;
use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

pub const DEFAULT_API: &str = "cloudprofiler.googleapis.com:443";

/// File `perf record` writes into its working directory.
pub const CAPTURE_FILE: &str = "perf.data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    /// Collect forever; a failed capture only drops that profile.
    Continuous,
    /// Collect forever; any failed capture stops the agent.
    Strict,
    /// Collect and upload a single profile, then exit.
    Once,
}

#[derive(Parser, Debug)]
#[command(
    name = "perfagent",
    version,
    about = "Runs perf profiles on request of Cloud Profiler and uploads them",
    after_help = "\
EXAMPLES:
    perfagent --project my-proj --service web
    perfagent --mode once --label zone=us-east1-b
    perfagent --enable-perf-mem --enable-perf-lock
    perfagent -- perf record -F 49 -g sleep '{{ .Duration.Seconds }}'"
)]
pub struct Args {
    /// host:port of the Cloud Profiler API
    #[arg(long, default_value = DEFAULT_API)]
    pub api: String,

    /// Talk plaintext HTTP/2 to the API, for local test servers
    #[arg(long)]
    pub insecure: bool,

    /// Token file: JSON with an already minted `access_token` and optionally
    /// `project_id`, e.g. from `gcloud auth print-access-token`. Service
    /// account key files are not accepted (default: metadata server
    /// credentials)
    #[arg(long, value_name = "FILE")]
    pub credentials_json: Option<PathBuf>,

    /// Google Cloud project id (inferred when omitted)
    #[arg(long)]
    pub project: Option<String>,

    /// Service name reported as the deployment target (default: host name)
    #[arg(long)]
    pub service: Option<String>,

    /// Deployment label, may be repeated
    #[arg(long = "label", value_name = "KEY=VALUE", value_parser = parse_label)]
    pub labels: Vec<(String, String)>,

    #[arg(long, value_enum, default_value_t = RunMode::Continuous)]
    pub mode: RunMode,

    /// Directory for captures and symbol trees (default: a temporary one)
    #[arg(long, value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// CreateProfile attempts before giving up
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_ATTEMPTS,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_attempts: u32,

    /// Also offer HEAP profiles, collected with `perf mem record`
    #[arg(long)]
    pub enable_perf_mem: bool,

    /// Also offer CONTENTION profiles, collected with `perf lock record`
    #[arg(long)]
    pub enable_perf_lock: bool,

    /// perf binary used to list build ids
    #[arg(long, default_value = "perf")]
    pub perf: String,

    /// Converter from perf.data to pprof
    #[arg(long, default_value = "perf_to_profile")]
    pub perf_to_profile: String,

    /// CPU sampling command; arguments may use {{ .Duration.Seconds }} and other
    /// request fields (default: perf record -ag -F 99 sleep {{ .Duration.Seconds }})
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
    }
}

/// Everything the collection loop needs to know, fixed at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub api: String,
    pub insecure: bool,
    pub credentials: CredentialsSource,
    pub deployment: Deployment,
    pub mode: RunMode,
    pub workdir: Option<PathBuf>,
    /// Sampling command per profile kind; the keys are what the agent offers.
    pub sampling: BTreeMap<ProfileType, CommandTemplate>,
    pub capture_file: PathBuf,
    pub resolver: SymbolResolver,
    pub converter: FormatConverter,
    pub termination: TerminationPolicy,
    pub retry: RetryPolicy,
    pub stderr_limit: usize,
}

impl AgentConfig {
    /// May block on the metadata server while inferring the project.
    pub fn from_args(args: Args) -> anyhow::Result<Self> {
        let credentials = match (&args.credentials_json, args.insecure) {
            (Some(path), _) => CredentialsSource::File(path.clone()),
            (None, true) => CredentialsSource::Anonymous,
            (None, false) => CredentialsSource::Ambient,
        };

        let project_id = match args.project {
            Some(project) => project,
            None => credentials::infer_project(&credentials)?,
        };
        let target = match args.service {
            Some(service) => service,
            None => infer_service()?,
        };

        let mut labels = HashMap::new();
        for (key, value) in args.labels {
            if labels.contains_key(&key) {
                bail!("duplicate label {}", key);
            }
            labels.insert(key, value);
        }

        let mut sampling = BTreeMap::new();
        let cpu = if args.command.is_empty() {
            CommandTemplate::default_perf()
        } else {
            CommandTemplate::new(args.command)?
        };
        sampling.insert(ProfileType::Cpu, cpu);
        if args.enable_perf_mem {
            sampling.insert(ProfileType::Heap, CommandTemplate::perf_mem());
        }
        if args.enable_perf_lock {
            sampling.insert(ProfileType::Contention, CommandTemplate::perf_lock());
        }

        Ok(Self {
            api: args.api,
            insecure: args.insecure,
            credentials,
            deployment: Deployment {
                project_id,
                target,
                labels,
            },
            mode: args.mode,
            workdir: args.workdir,
            sampling,
            capture_file: PathBuf::from(CAPTURE_FILE),
            resolver: SymbolResolver::perf(&args.perf, DEFAULT_STDERR_LIMIT),
            converter: FormatConverter::perf_to_profile(
                &args.perf_to_profile,
                DEFAULT_STDERR_LIMIT,
            ),
            termination: TerminationPolicy::default(),
            retry: RetryPolicy {
                max_attempts: args.max_attempts,
                ..RetryPolicy::default()
            },
            stderr_limit: DEFAULT_STDERR_LIMIT,
        })
    }
}

fn infer_service() -> anyhow::Result<String> {
    let host = nix::unistd::gethostname().context("could not determine service")?;
    match host.into_string() {
        Ok(host) if !host.is_empty() => Ok(host),
        _ => bail!("could not determine service from host name, pass --service"),
    }
}
