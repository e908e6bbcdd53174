//! Renders the sampling command line for a collection request.
//!
//! Every argument of the template may reference request fields with
//! `{{ .Field }}` placeholders. The fields are exposed through
//! [`RenderParams`]; the most useful one is `.Duration.Seconds`, the requested
//! profile duration as a plain number of seconds. An argument that fails to
//! parse or render is passed through verbatim, so a single odd argument never
//! costs the whole command line.

use crate::cloudprofilerpb::{Deployment, Profile};
use crate::subprocess::ToolCommand;
use anyhow::bail;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Used when a request carries no usable duration.
pub const DEFAULT_PROFILE_DURATION: Duration = Duration::from_secs(10);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated placeholder at offset {0}")]
    Unterminated(usize),

    #[error("malformed field reference {0:?}")]
    BadField(String),

    #[error("no field {0:?}")]
    UnknownField(String),
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Field(&'a str),
}

/// Fields of a collection request that a command line may reference.
#[derive(Debug)]
pub struct RenderParams<'a> {
    pub name: &'a str,
    pub profile_type: &'static str,
    pub duration: Duration,
    pub deployment: Option<&'a Deployment>,
    pub labels: &'a HashMap<String, String>,
}

impl<'a> RenderParams<'a> {
    pub fn from_profile(profile: &'a Profile) -> Self {
        Self {
            name: &profile.name,
            profile_type: profile.profile_type().as_str_name(),
            duration: requested_duration(profile),
            deployment: profile.deployment.as_ref(),
            labels: &profile.labels,
        }
    }

    fn lookup(&self, field: &str) -> Option<String> {
        match field {
            "Name" => Some(self.name.to_string()),
            "ProfileType" => Some(self.profile_type.to_string()),
            "Duration" => Some(format!("{}s", format_seconds(self.duration))),
            "Duration.Seconds" => Some(format_seconds(self.duration)),
            "Duration.Millis" => Some(self.duration.as_millis().to_string()),
            "Deployment.ProjectId" => self.deployment.map(|d| d.project_id.clone()),
            "Deployment.Target" => self.deployment.map(|d| d.target.clone()),
            _ => {
                let key = field.strip_prefix("Labels.")?;
                self.labels
                    .get(key)
                    .or_else(|| self.deployment.and_then(|d| d.labels.get(key)))
                    .cloned()
            }
        }
    }
}

/// The duration the service asked for, or the default when it is missing,
/// negative or zero.
pub fn requested_duration(profile: &Profile) -> Duration {
    match profile.duration.clone().map(Duration::try_from) {
        Some(Ok(d)) if !d.is_zero() => d,
        Some(Ok(_)) | None => DEFAULT_PROFILE_DURATION,
        Some(Err(e)) => {
            log::warn!(
                "could not parse duration from profile {}: {}, using default {:?}",
                profile.name,
                e,
                DEFAULT_PROFILE_DURATION
            );
            DEFAULT_PROFILE_DURATION
        }
    }
}

fn format_seconds(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        d.as_secs().to_string()
    } else {
        d.as_secs_f64().to_string()
    }
}

fn parse(arg: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = arg;
    let mut offset = 0;

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(Segment::Literal(&rest[..open]));
        }
        let inner_start = open + 2;
        let close = rest[inner_start..]
            .find("}}")
            .ok_or(TemplateError::Unterminated(offset + open))?;
        let inner = rest[inner_start..inner_start + close].trim();
        let field = inner
            .strip_prefix('.')
            .filter(|f| !f.is_empty() && !f.contains(char::is_whitespace))
            .ok_or_else(|| TemplateError::BadField(inner.to_string()))?;
        segments.push(Segment::Field(field));

        let consumed = inner_start + close + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}

/// Renders a single argument.
pub fn render_arg(arg: &str, params: &RenderParams<'_>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(arg.len());
    for segment in parse(arg)? {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Field(field) => {
                let value = params
                    .lookup(field)
                    .ok_or_else(|| TemplateError::UnknownField(field.to_string()))?;
                out.push_str(&value);
            }
        }
    }
    Ok(out)
}

/// A sampling command line whose arguments may contain placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    argv: Vec<String>,
}

impl CommandTemplate {
    pub fn new(argv: Vec<String>) -> anyhow::Result<Self> {
        if argv.is_empty() {
            bail!("sampling command must name a program");
        }
        Ok(Self { argv })
    }

    fn from_static(argv: &[&str]) -> Self {
        Self {
            argv: argv.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// `perf record -ag -F 99 sleep {{ .Duration.Seconds }}`
    pub fn default_perf() -> Self {
        Self::from_static(&[
            "perf",
            "record",
            "-ag",
            "-F",
            "99",
            "sleep",
            "{{ .Duration.Seconds }}",
        ])
    }

    /// `perf mem record sleep {{ .Duration.Seconds }}`
    pub fn perf_mem() -> Self {
        Self::from_static(&["perf", "mem", "record", "sleep", "{{ .Duration.Seconds }}"])
    }

    /// `perf lock record sleep {{ .Duration.Seconds }}`
    pub fn perf_lock() -> Self {
        Self::from_static(&["perf", "lock", "record", "sleep", "{{ .Duration.Seconds }}"])
    }

    /// Fresh command for `profile`. Never fails; see the module docs.
    pub fn instantiate(&self, profile: &Profile) -> ToolCommand {
        let params = RenderParams::from_profile(profile);
        let mut argv = self.argv.iter().map(|arg| match render_arg(arg, &params) {
            Ok(rendered) => rendered,
            Err(e) => {
                log::warn!("leaving argument {:?} as is: {}", arg, e);
                arg.clone()
            }
        });
        // argv is non-empty by construction
        let program = argv.next().unwrap_or_default();
        ToolCommand::new(program, argv)
    }
}
