use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, anyhow};

use crate::definition::{CommandSpec, EnvironmentSpec};

/// Platform-specific behaviour behind the build, package, sign and test
/// capabilities. One implementation is chosen per run from the environment
/// descriptor; stages never branch on the platform name themselves.
pub trait Toolchain: Send + Sync {
    fn platform(&self) -> &str;

    /// Name of the packaging tool, e.g. `pyinstaller`.
    fn tool(&self) -> &str;

    /// Variables exposed to stage command templates.
    fn build_variables(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("platform".to_string(), self.platform().to_string());
        vars.insert("toolchain".to_string(), self.tool().to_string());
        vars.insert(
            "exe_suffix".to_string(),
            self.executable_suffix().to_string(),
        );
        vars
    }

    fn executable_suffix(&self) -> &'static str {
        ""
    }

    /// Archive name for a published artifact, independent of its logical name.
    fn artifact_file_name(&self, logical: &str, version: &str, extension: &str) -> String {
        format!("{logical}-{version}-{}.{extension}", self.platform())
    }

    /// Signature scheme requested from the signing service.
    fn signing_policy(&self) -> &'static str;

    /// Command used to exercise the packaged executable.
    fn smoke_command(&self, executable: &Path, args: &[String]) -> CommandSpec {
        CommandSpec {
            program: executable.to_string_lossy().to_string(),
            args: args.to_vec(),
            cwd: None,
            success_codes: vec![0],
        }
    }
}

struct WindowsToolchain {
    platform: String,
    tool: String,
}

impl Toolchain for WindowsToolchain {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn tool(&self) -> &str {
        &self.tool
    }

    fn executable_suffix(&self) -> &'static str {
        ".exe"
    }

    fn signing_policy(&self) -> &'static str {
        "authenticode"
    }
}

struct MacosToolchain {
    platform: String,
    tool: String,
}

impl Toolchain for MacosToolchain {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn tool(&self) -> &str {
        &self.tool
    }

    fn signing_policy(&self) -> &'static str {
        "codesign"
    }
}

struct LinuxToolchain {
    platform: String,
    tool: String,
}

impl Toolchain for LinuxToolchain {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn tool(&self) -> &str {
        &self.tool
    }

    fn signing_policy(&self) -> &'static str {
        "detached-gpg"
    }
}

type ToolchainConstructor = Arc<dyn Fn(&EnvironmentSpec) -> Box<dyn Toolchain> + Send + Sync>;

pub struct ToolchainRegistry {
    factories: HashMap<String, ToolchainConstructor>,
}

impl Default for ToolchainRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        register_defaults(&mut registry);
        registry
    }
}

impl ToolchainRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, platform: impl Into<String>, constructor: F)
    where
        F: Fn(&EnvironmentSpec) -> Box<dyn Toolchain> + Send + Sync + 'static,
    {
        self.factories.insert(platform.into(), Arc::new(constructor));
    }

    pub fn select(&self, environment: &EnvironmentSpec) -> Result<Box<dyn Toolchain>> {
        let factory = self.factories.get(&environment.platform).ok_or_else(|| {
            anyhow!(
                "Unknown platform '{}'. Available platforms: {}",
                environment.platform,
                self.known_platforms().join(", ")
            )
        })?;
        Ok(factory(environment))
    }

    pub fn known_platforms(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

pub fn register_defaults(registry: &mut ToolchainRegistry) {
    for platform in ["windows-x86", "windows-x64"] {
        registry.register(platform, move |env| {
            Box::new(WindowsToolchain {
                platform: platform.to_string(),
                tool: env.toolchain.clone(),
            })
        });
    }
    for platform in ["macos-x64", "macos-arm64"] {
        registry.register(platform, move |env| {
            Box::new(MacosToolchain {
                platform: platform.to_string(),
                tool: env.toolchain.clone(),
            })
        });
    }
    for platform in ["linux-x64", "linux-arm64"] {
        registry.register(platform, move |env| {
            Box::new(LinuxToolchain {
                platform: platform.to_string(),
                tool: env.toolchain.clone(),
            })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environment(platform: &str) -> EnvironmentSpec {
        EnvironmentSpec {
            platform: platform.to_string(),
            toolchain: "pyinstaller".to_string(),
            variables: BTreeMap::new(),
        }
    }

    #[test]
    fn windows_toolchain_adds_exe_suffix() {
        let registry = ToolchainRegistry::default();
        let toolchain = registry.select(&environment("windows-x64")).unwrap();
        let vars = toolchain.build_variables();
        assert_eq!(vars.get("exe_suffix").map(String::as_str), Some(".exe"));
        assert_eq!(toolchain.signing_policy(), "authenticode");
        assert_eq!(
            toolchain.artifact_file_name("portable", "0.6.1", "tar.gz"),
            "portable-0.6.1-windows-x64.tar.gz"
        );
    }

    #[test]
    fn unknown_platform_lists_known_ones() {
        let registry = ToolchainRegistry::default();
        let err = registry
            .select(&environment("amiga-m68k"))
            .err()
            .unwrap()
            .to_string();
        assert!(err.contains("linux-x64"));
        assert!(err.contains("windows-x64"));
    }
}
