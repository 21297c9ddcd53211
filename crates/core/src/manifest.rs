//! Manifest model and reader
//!
//! The manifest is a YAML document (`.infinity.yaml`) describing application metadata, global
//! environment and named targets, each an ordered list of stages. A stage with child `stages`
//! is a parallel group; any other stage is a leaf run by its runner. Keys a stage does not
//! define are kept as parameters and surface as `INFINITY_PARAMETER_*` variables.
//!
//! Defaults are applied on read, so the engine only ever sees a defaulted manifest.

use crate::env;
use crate::errors::{ManifestError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, instrument};

/// Default working directory inside stage containers
pub const DEFAULT_WORKING_DIRECTORY: &str = "/work";

/// Default shell used as container entrypoint
pub const DEFAULT_SHELL: &str = "/bin/sh";

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $value:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            /// Any value outside the supported set, kept verbatim for reporting
            Unknown(String),
        }

        impl $name {
            /// Every supported value in declaration order
            pub const SUPPORTED: &'static [&'static str] = &[$($value),+];

            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $value,)+
                    Self::Unknown(value) => value,
                }
            }

            pub fn is_supported(&self) -> bool {
                !matches!(self, Self::Unknown(_))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::Unknown(String::new())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                match value.as_str() {
                    $($value => Self::$variant,)+
                    _ => Self::Unknown(value),
                }
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum! {
    /// Kind of application the manifest builds
    ApplicationType {
        Library => "library",
        Cli => "cli",
        Firmware => "firmware",
        Api => "api",
        Web => "web",
        Controller => "controller",
    }
}

string_enum! {
    /// Main language of the application
    Language {
        Go => "go",
        C => "c",
        CPlusPlus => "c++",
        Java => "java",
        CSharp => "csharp",
        Python => "python",
        Node => "node",
    }
}

string_enum! {
    /// Where a leaf stage runs
    RunnerType {
        Container => "container",
        Host => "host",
    }
}

/// Accept any scalar YAML value for an environment map and keep its string form
fn deserialize_env<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, serde_yaml::Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, value_to_string(&v)))
        .collect())
}

/// Render a YAML value the way it appears in an environment variable
pub fn value_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub metadata: ManifestMetadata,
    #[serde(default, deserialize_with = "deserialize_env")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub targets: Vec<ManifestTarget>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub application_type: ApplicationType,
    #[serde(default)]
    pub language: Language,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestTarget {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_env")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub stages: Vec<ManifestStage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestStage {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub runner: Option<RunnerType>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub privileged: bool,
    /// Mount the build directory at `work`
    #[serde(default)]
    pub mount: Option<bool>,
    #[serde(default)]
    pub work: Option<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_env")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub stages: Vec<ManifestStage>,
    /// Every other key, passed to the stage as a parameter
    #[serde(flatten)]
    pub parameters: BTreeMap<String, serde_yaml::Value>,
}

impl Manifest {
    /// Parse a manifest from YAML and apply defaults
    pub fn from_yaml(content: &str, path: &str) -> Result<Self> {
        let mut manifest: Manifest =
            serde_yaml::from_str(content).map_err(|e| ManifestError::Parsing {
                path: path.to_string(),
                message: e.to_string(),
            })?;
        manifest.set_defaults();
        Ok(manifest)
    }

    pub fn set_defaults(&mut self) {
        for target in &mut self.targets {
            target.set_defaults();
        }
    }

    /// Collect warnings and errors for the whole manifest
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = self.metadata.validate();

        for target in &self.targets {
            let (w, e) = target.validate();
            warnings.extend(w);
            errors.extend(e);
        }

        (warnings, errors)
    }

    /// Look up a target by name
    pub fn target(&self, name: &str) -> Result<&ManifestTarget> {
        self.targets
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| {
                ManifestError::UnknownTarget {
                    target: name.to_string(),
                }
                .into()
            })
    }

    /// Environment shared by every stage of `target`
    ///
    /// Metadata variables, overridden by the manifest env, overridden by the target env.
    pub fn target_env(&self, target: &ManifestTarget) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            "INFINITY_METADATA_NAME".to_string(),
            self.metadata.name.clone(),
        );
        env.insert(
            "INFINITY_METADATA_TYPE".to_string(),
            self.metadata.application_type.to_string(),
        );
        env.insert(
            "INFINITY_METADATA_LANGUAGE".to_string(),
            self.metadata.language.to_string(),
        );
        env.extend(self.env.clone());
        env.extend(target.env.clone());
        env
    }
}

impl ManifestMetadata {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !self.application_type.is_supported() {
            errors.push(format!(
                "application is unknown; set to a supported application type with 'type: {}'",
                ApplicationType::SUPPORTED.join("|")
            ));
        }
        if !self.language.is_supported() {
            errors.push(format!(
                "language is unknown; set to a supported language with 'language: {}'",
                Language::SUPPORTED.join("|")
            ));
        }
        if self.name.is_empty() {
            errors.push("application has no name; please set 'name: <name>'".to_string());
        }

        errors
    }
}

impl ManifestTarget {
    fn set_defaults(&mut self) {
        for stage in &mut self.stages {
            stage.set_defaults();
        }
    }

    fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push("target has no name; please set 'name: <name>'".to_string());
        }
        if self.stages.is_empty() {
            errors.push(
                "target has no stages; define at least one stage through 'stages'".to_string(),
            );
        }

        for stage in &self.stages {
            stage.validate(&[], &mut warnings, &mut errors);
        }

        (warnings, errors)
    }
}

impl ManifestStage {
    /// Whether this stage is a parallel group
    pub fn is_group(&self) -> bool {
        !self.stages.is_empty()
    }

    pub fn runner_type(&self) -> RunnerType {
        self.runner.clone().unwrap_or(RunnerType::Container)
    }

    pub fn mounts_working_directory(&self) -> bool {
        self.mount.unwrap_or(true)
    }

    pub fn working_directory(&self) -> &str {
        self.work.as_deref().unwrap_or(DEFAULT_WORKING_DIRECTORY)
    }

    pub fn shell(&self) -> &str {
        self.shell.as_deref().unwrap_or(DEFAULT_SHELL)
    }

    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or_default()
    }

    /// Whether this stage or any stage below it runs in the background
    pub fn has_background(&self) -> bool {
        self.background || self.stages.iter().any(ManifestStage::has_background)
    }

    fn set_defaults(&mut self) {
        if self.runner.is_none() {
            self.runner = Some(RunnerType::Container);
        }
        if self.mount.is_none() {
            self.mount = Some(true);
        }
        if self.work.as_deref().map_or(true, str::is_empty) {
            self.work = Some(DEFAULT_WORKING_DIRECTORY.to_string());
        }
        if self.shell.as_deref().map_or(true, str::is_empty) {
            self.shell = Some(DEFAULT_SHELL.to_string());
        }
        for stage in &mut self.stages {
            stage.set_defaults();
        }
    }

    fn validate(&self, parents: &[&str], warnings: &mut Vec<String>, errors: &mut Vec<String>) {
        let mut chain = parents.to_vec();
        chain.push(if self.name.is_empty() {
            "?"
        } else {
            self.name.as_str()
        });
        let prefix = format!("[{}]", chain.join("] ["));

        if self.name.is_empty() {
            errors.push(format!(
                "{} stage has no name; please set 'name: <name>'",
                prefix
            ));
        }

        if !self.is_group() {
            let runner = self.runner_type();
            if !runner.is_supported() {
                errors.push(format!(
                    "{} unknown runner; please set 'runner: {}'",
                    prefix,
                    RunnerType::SUPPORTED.join("|")
                ));
            }
            if self.commands.is_empty() && !self.background {
                warnings.push(format!(
                    "{} stage has no commands; you might want to define at least one command through 'commands'",
                    prefix
                ));
            }

            match runner {
                RunnerType::Container if self.image().is_empty() => {
                    errors.push(format!(
                        "{} stage has no image; please set 'image: <image>'",
                        prefix
                    ));
                }
                RunnerType::Host if !self.image().is_empty() => {
                    errors.push(format!(
                        "{} stage has image which is not supported in combination with 'runner: host'; please do not set 'image: <image>'",
                        prefix
                    ));
                }
                _ => {}
            }
        }

        for stage in &self.stages {
            stage.validate(&chain, warnings, errors);
        }
    }

    /// Environment for this leaf: `base`, then parameters, then the stage's own env
    pub fn environment(&self, base: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut merged = base.clone();
        for (key, value) in &self.parameters {
            merged.insert(env::parameter_name(key), value_to_string(value));
        }
        merged.extend(self.env.clone());
        merged
    }
}

/// Read, parse and default the manifest at `path`
#[instrument(skip_all, fields(path = %path.display()))]
pub fn read_manifest(path: &Path) -> Result<Manifest> {
    let display = path.display().to_string();

    if !path.exists() {
        return Err(ManifestError::NotFound { path: display }.into());
    }

    let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: display.clone(),
        source,
    })?;

    let manifest = Manifest::from_yaml(&content, &display)?;
    debug!(targets = manifest.targets.len(), "Read manifest");
    Ok(manifest)
}
