//! Plugin Manifests
//!
//! A plugin archive is a `.plugin` TOML file naming the executable to run
//! and the entry types it provides. Only concrete entries that implement
//! `Command` become commands.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::PluginError;
use super::naming::command_name;

/// Capability an entry must implement to be registered
pub const COMMAND_CAPABILITY: &str = "Command";

/// Parsed `.plugin` file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub plugin: PluginSection,
    #[serde(default)]
    pub entries: Vec<EntryDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSection {
    pub name: String,
    /// Relative paths resolve against the manifest's directory
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One type exported by the plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDecl {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub implements: Vec<String>,
    #[serde(default)]
    pub kind: EntryKind,
    /// Registry name to use instead of the derived one
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    #[default]
    Concrete,
    Abstract,
    Interface,
}

/// An entry that will be registered as a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEntry {
    pub type_name: String,
    pub name: String,
}

impl PluginManifest {
    pub fn load(path: &Path) -> Result<Self, PluginError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, PluginError> {
        Ok(toml::from_str(content)?)
    }

    /// Entries that qualify as commands, with their registry names
    pub fn commands(&self) -> Vec<CommandEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.is_command())
            .map(|entry| CommandEntry {
                type_name: entry.type_name.clone(),
                name: entry
                    .name
                    .clone()
                    .unwrap_or_else(|| command_name(&entry.type_name)),
            })
            .collect()
    }

    /// Executable path for a manifest stored in `dir`
    pub fn executable_in(&self, dir: &Path) -> PathBuf {
        if self.plugin.executable.is_absolute() {
            self.plugin.executable.clone()
        } else {
            dir.join(&self.plugin.executable)
        }
    }
}

impl EntryDecl {
    fn is_command(&self) -> bool {
        self.kind == EntryKind::Concrete
            && self.type_name != COMMAND_CAPABILITY
            && self.implements.iter().any(|i| i == COMMAND_CAPABILITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THERMOSTAT: &str = r#"
        [plugin]
        name = "thermostat"
        executable = "bin/thermostat-plugin"

        [[entries]]
        type = "SetTemperatureCommand"
        implements = ["Command"]

        [[entries]]
        type = "ThermostatCommand"
        implements = ["Command"]
        kind = "abstract"

        [[entries]]
        type = "Command"
        implements = ["Command"]
        kind = "interface"

        [[entries]]
        type = "Calibration"
        implements = ["Serializable"]

        [[entries]]
        type = "ResetCommand"
        implements = ["Command"]
        name = "Factory Reset"
    "#;

    #[test]
    fn test_only_concrete_commands_are_registered() {
        let manifest = PluginManifest::parse(THERMOSTAT).unwrap();
        assert_eq!(manifest.plugin.name, "thermostat");
        assert!(manifest.plugin.args.is_empty());

        assert_eq!(
            manifest.commands(),
            vec![
                CommandEntry {
                    type_name: "SetTemperatureCommand".to_string(),
                    name: "Set Temperature".to_string(),
                },
                CommandEntry {
                    type_name: "ResetCommand".to_string(),
                    name: "Factory Reset".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_executable_resolves_against_manifest_dir() {
        let manifest = PluginManifest::parse(THERMOSTAT).unwrap();
        assert_eq!(
            manifest.executable_in(Path::new("/opt/plugins")),
            PathBuf::from("/opt/plugins/bin/thermostat-plugin")
        );
    }

    #[test]
    fn test_missing_plugin_section_is_an_error() {
        let result = PluginManifest::parse("[[entries]]\ntype = \"X\"\n");
        assert!(matches!(result, Err(PluginError::Manifest(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thermostat.plugin");
        std::fs::write(&path, THERMOSTAT).unwrap();

        let manifest = PluginManifest::load(&path).unwrap();
        assert_eq!(manifest.commands().len(), 2);
        assert!(matches!(
            PluginManifest::load(&dir.path().join("missing.plugin")),
            Err(PluginError::Io(_))
        ));
    }
}
