//! Engine catalog - Supported simulators, their aircraft and launch commands

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::ManagerError;
use super::instance::InstanceId;
use super::process::ProcessSpec;

/// Supported simulator backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    Px4,
}

impl EngineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Px4 => "px4",
        }
    }

    pub fn all() -> &'static [EngineType] {
        &[EngineType::Px4]
    }
}

impl std::fmt::Display for EngineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EngineType {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|e| e.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ManagerError::UnknownEngine(s.to_string()))
    }
}

/// A vehicle the engine knows how to simulate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AircraftSpec {
    pub name: String,
    pub description: String,
    /// Simulator model name, defaults to `name`
    #[serde(default)]
    pub model: Option<String>,
    /// Airframe autostart id handed to the engine
    #[serde(default = "default_autostart")]
    pub autostart_id: String,
}

fn default_autostart() -> String {
    "4001".to_string()
}

impl AircraftSpec {
    pub fn new(name: &str, description: &str, autostart_id: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            model: None,
            autostart_id: autostart_id.to_string(),
        }
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(&self.name)
    }
}

/// Catalog entry exposed through `list_engines`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AircraftSummary {
    pub name: String,
    pub description: String,
}

/// How to launch one engine and which aircraft it offers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    pub engine: EngineType,
    /// Engine executable (resolved on PATH unless it contains a separator)
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Directory the engine runs in; the instance directory when unset
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Files (relative to `working_dir`) that must exist for the engine to be usable
    #[serde(default)]
    pub requires: Vec<PathBuf>,
    /// Local telemetry port of slot 0; slot `n` uses `telemetry_port + n`
    pub telemetry_port: u16,
    #[serde(default)]
    pub aircraft: Vec<AircraftSpec>,
}

impl EngineSettings {
    /// PX4 SITL driven through its make target, Gazebo headless
    pub fn px4(px4_path: impl Into<PathBuf>) -> Self {
        let mut env = BTreeMap::new();
        env.insert("HEADLESS".to_string(), "1".to_string());
        env.insert("PX4_SIM_HOSTNAME".to_string(), "localhost".to_string());
        env.insert("PX4_SYS_AUTOSTART".to_string(), "{autostart}".to_string());
        env.insert("PX4_INSTANCE".to_string(), "{slot}".to_string());

        Self {
            engine: EngineType::Px4,
            command: "make".to_string(),
            args: vec!["px4_sitl".to_string(), "gz_{model}".to_string()],
            env,
            working_dir: Some(px4_path.into()),
            requires: vec![PathBuf::from("build/px4_sitl_default/bin/px4")],
            telemetry_port: 14540,
            aircraft: vec![
                AircraftSpec::new("iris", "Iris Quadcopter", "4001"),
                AircraftSpec::new("x500", "X500 Quadcopter", "4001"),
                AircraftSpec::new("solo", "3DR Solo Quadcopter", "4001"),
                AircraftSpec::new("plane", "Generic Fixed-wing Aircraft", "2100"),
                AircraftSpec::new("rover", "Generic Ground Rover", "50000"),
            ],
        }
    }

    pub fn find_aircraft(&self, name: &str) -> Option<&AircraftSpec> {
        self.aircraft.iter().find(|a| a.name == name)
    }
}

/// Telemetry router companion launched next to every engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        // Listen on the instance port, forward to the engine's local endpoint.
        // TCP server disabled so routers don't fight over 5760.
        Self {
            command: "mavlink-routerd".to_string(),
            args: vec![
                "-t".to_string(),
                "0".to_string(),
                "-e".to_string(),
                "127.0.0.1:{telemetry_port}".to_string(),
                "0.0.0.0:{port}".to_string(),
            ],
            env: BTreeMap::new(),
        }
    }
}

/// Values substituted into command templates
#[derive(Debug, Clone)]
pub struct LaunchContext<'a> {
    pub instance_id: InstanceId,
    pub port: u16,
    pub slot: u16,
    pub aircraft: &'a AircraftSpec,
    pub workdir: &'a Path,
}

impl LaunchContext<'_> {
    /// Replace `{placeholder}` tokens in a template
    pub fn render(&self, template: &str, telemetry_port: u16) -> String {
        template
            .replace("{port}", &self.port.to_string())
            .replace("{slot}", &self.slot.to_string())
            .replace("{model}", self.aircraft.model())
            .replace("{aircraft}", &self.aircraft.name)
            .replace("{autostart}", &self.aircraft.autostart_id)
            .replace("{telemetry_port}", &telemetry_port.to_string())
            .replace("{instance_id}", &self.instance_id.to_string())
            .replace("{workdir}", &self.workdir.to_string_lossy())
    }
}

/// Validated view over the configured engines
#[derive(Debug, Clone)]
pub struct EngineCatalog {
    engines: BTreeMap<EngineType, EngineSettings>,
    router: RouterSettings,
}

impl EngineCatalog {
    pub fn new(engines: &[EngineSettings], router: RouterSettings) -> Self {
        Self {
            engines: engines.iter().map(|e| (e.engine, e.clone())).collect(),
            router,
        }
    }

    pub fn engine_types(&self) -> impl Iterator<Item = EngineType> + '_ {
        self.engines.keys().copied()
    }

    pub fn engine(&self, engine: EngineType) -> Option<&EngineSettings> {
        self.engines.get(&engine)
    }

    /// Resolve a create request against the catalog
    pub fn lookup(
        &self,
        engine: &str,
        aircraft: &str,
    ) -> Result<(EngineType, &EngineSettings, &AircraftSpec), ManagerError> {
        let engine_type: EngineType = engine.parse()?;
        let settings = self
            .engines
            .get(&engine_type)
            .ok_or_else(|| ManagerError::UnknownEngine(engine.to_string()))?;
        let spec = settings
            .find_aircraft(aircraft)
            .ok_or_else(|| ManagerError::UnknownAircraft {
                engine: engine_type.to_string(),
                aircraft: aircraft.to_string(),
            })?;
        Ok((engine_type, settings, spec))
    }

    /// Aircraft offered per engine
    pub fn list(&self) -> BTreeMap<String, Vec<AircraftSummary>> {
        self.engines
            .values()
            .map(|e| {
                let aircraft = e
                    .aircraft
                    .iter()
                    .map(|a| AircraftSummary {
                        name: a.name.clone(),
                        description: a.description.clone(),
                    })
                    .collect();
                (e.engine.to_string(), aircraft)
            })
            .collect()
    }

    /// Engine and router executables resolvable, required files present
    pub fn is_installed(&self, engine: EngineType) -> bool {
        let Some(settings) = self.engines.get(&engine) else {
            return false;
        };
        let base = settings.working_dir.as_deref();
        let required_present = settings
            .requires
            .iter()
            .all(|p| base.map(|b| b.join(p)).unwrap_or_else(|| p.clone()).exists());

        required_present
            && resolve_executable(&settings.command, base).is_some()
            && resolve_executable(&self.router.command, None).is_some()
    }

    /// Build the engine and router process specs for one instance
    pub fn plan_launch(
        &self,
        settings: &EngineSettings,
        ctx: &LaunchContext<'_>,
    ) -> (ProcessSpec, ProcessSpec) {
        let telemetry_port = settings.telemetry_port.saturating_add(ctx.slot);
        let render_all = |items: &[String]| -> Vec<String> {
            items.iter().map(|a| ctx.render(a, telemetry_port)).collect()
        };
        let render_env = |env: &BTreeMap<String, String>| -> Vec<(String, String)> {
            env.iter()
                .map(|(k, v)| (k.clone(), ctx.render(v, telemetry_port)))
                .collect()
        };

        let mut engine_env = render_env(&settings.env);
        engine_env.push((
            "SITL_INSTANCE_DIR".to_string(),
            ctx.workdir.to_string_lossy().to_string(),
        ));

        let engine = ProcessSpec {
            name: format!("{}-engine", settings.engine),
            command: settings.command.clone(),
            args: render_all(&settings.args),
            env: engine_env,
            working_dir: settings
                .working_dir
                .clone()
                .unwrap_or_else(|| ctx.workdir.to_path_buf()),
            log_file: Some(ctx.workdir.join("engine.log")),
        };

        let router = ProcessSpec {
            name: "router".to_string(),
            command: self.router.command.clone(),
            args: render_all(&self.router.args),
            env: render_env(&self.router.env),
            working_dir: ctx.workdir.to_path_buf(),
            log_file: Some(ctx.workdir.join("router.log")),
        };

        (engine, router)
    }
}

/// Find an executable the way a shell would
///
/// Commands containing a path separator are taken relative to `base`.
pub fn resolve_executable(command: &str, base: Option<&Path>) -> Option<PathBuf> {
    if command.contains(std::path::MAIN_SEPARATOR) || command.contains('/') {
        let path = Path::new(command);
        let full = match base {
            Some(b) if path.is_relative() => b.join(path),
            _ => path.to_path_buf(),
        };
        return full.is_file().then_some(full);
    }
    which::which(command).ok()
}
