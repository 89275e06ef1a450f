use crate::fault::{FaultInfo, MonitorData};
use anyhow::{Context, anyhow};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::HashMap;
use std::str::FromStr;

/// Arguments of the `IterationStarting` notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationStartingArgs {
    pub iteration: u32,
    pub is_reproduction: bool,
    pub last_was_fault: bool,
}

/// A `Monitor` watches the target for faults on behalf of the agent.
///
/// Monitors are created (and thereby started) by `StartMonitor` and receive
/// the session and iteration notifications in the order the engine sends
/// them. A hook returning `Err` fails only that one request; the monitor stays
/// registered.
pub trait Monitor: Send {
    /// Called when the monitor is removed by `StopMonitor`, `StopAllMonitors`
    /// or session teardown.
    fn stop(&mut self) -> Result<(), anyhow::Error>;

    fn session_starting(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn session_finished(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn iteration_starting(&mut self, args: &IterationStartingArgs) -> Result<(), anyhow::Error>;

    fn iteration_finished(&mut self) -> Result<(), anyhow::Error>;

    /// Whether a fault was observed during the iteration that just finished.
    fn detected_fault(&mut self) -> Result<bool, anyhow::Error>;

    /// Data describing the last iteration, if the monitor has any.
    fn get_monitor_data(&mut self) -> Result<Option<MonitorData>, anyhow::Error>;

    /// Free-form text from the engine.
    fn message(&mut self, _msg: &str) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Whether this monitor wants the fuzzing run to end.
    fn must_stop(&mut self) -> Result<bool, anyhow::Error> {
        Ok(false)
    }
}

/// Never reports anything.
#[derive(Default, Debug, Clone, Copy)]
pub struct NullMonitor;

impl Monitor for NullMonitor {
    fn stop(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn iteration_starting(&mut self, _args: &IterationStartingArgs) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn iteration_finished(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn detected_fault(&mut self) -> Result<bool, anyhow::Error> {
        Ok(false)
    }

    fn get_monitor_data(&mut self) -> Result<Option<MonitorData>, anyhow::Error> {
        Ok(None)
    }
}

const SEVERITY: [&str; 4] = [
    "EXPLOITABLE",
    "PROBABLY_EXPLOITABLE",
    "PROBABLY_NOT_EXPLOITABLE",
    "UNKNOWN",
];

fn arg_or<T: FromStr>(args: &HashMap<String, String>, name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match args.get(name) {
        Some(text) => text
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for monitor argument '{name}': {text}")),
        None => Ok(default),
    }
}

/// Produces random faults for exercising the engine's fault handling.
///
/// `Fault`, `NewMajor` and `NewMinor` are "one in N" odds; a `Fault` of zero
/// or less disables faulting. `Seed` fixes the random sequence. The monitor
/// never faults on its first iteration, nor while the engine has put it in
/// control mode by sending the message `true` (cleared by `false`).
pub struct RandoFaulter {
    rng: ChaCha8Rng,
    fault_odds: i64,
    new_major_odds: u32,
    new_minor_odds: u32,
    start_count: u32,
    is_control: bool,
    faulted: bool,
    buckets: Vec<(String, Vec<String>)>,
}

impl RandoFaulter {
    pub fn from_args(args: &HashMap<String, String>) -> anyhow::Result<Self> {
        let rng = match args.get("Seed") {
            Some(_) => ChaCha8Rng::seed_from_u64(arg_or(args, "Seed", 0u64)?),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };
        let new_major_odds: u32 = arg_or(args, "NewMajor", 5)?;
        let new_minor_odds: u32 = arg_or(args, "NewMinor", 5)?;
        if new_major_odds == 0 || new_minor_odds == 0 {
            return Err(anyhow!("NewMajor and NewMinor must be at least 1"));
        }
        Ok(Self {
            rng,
            fault_odds: arg_or(args, "Fault", 10)?,
            new_major_odds,
            new_minor_odds,
            start_count: 0,
            is_control: false,
            faulted: false,
            buckets: Vec::new(),
        })
    }

    fn one_in(&mut self, odds: u32) -> bool {
        self.rng.random_range(0..odds) == 0
    }

    fn random_bucket(&mut self) -> String {
        format!("{:08X}", self.rng.random::<u32>())
    }

    /// Picks a major/minor pair, reusing known buckets most of the time.
    fn next_buckets(&mut self) -> (String, String) {
        if self.buckets.is_empty() || self.one_in(self.new_major_odds) {
            let major = self.random_bucket();
            let minor = self.random_bucket();
            self.buckets.push((major.clone(), vec![minor.clone()]));
            return (major, minor);
        }

        let index = self.rng.random_range(0..self.buckets.len());
        if self.one_in(self.new_minor_odds) {
            let mut minor = self.random_bucket();
            while self.buckets[index].1.contains(&minor) {
                minor = self.random_bucket();
            }
            self.buckets[index].1.push(minor.clone());
            return (self.buckets[index].0.clone(), minor);
        }

        let minors = &self.buckets[index].1;
        let minor = minors[self.rng.random_range(0..minors.len())].clone();
        (self.buckets[index].0.clone(), minor)
    }
}

impl Monitor for RandoFaulter {
    fn stop(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn iteration_starting(&mut self, _args: &IterationStartingArgs) -> Result<(), anyhow::Error> {
        self.start_count += 1;
        self.faulted = false;
        Ok(())
    }

    fn iteration_finished(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn detected_fault(&mut self) -> Result<bool, anyhow::Error> {
        if self.start_count < 2 || self.is_control || self.fault_odds <= 0 {
            return Ok(false);
        }
        let odds = u32::try_from(self.fault_odds).unwrap_or(u32::MAX);
        self.faulted = self.one_in(odds);
        Ok(self.faulted)
    }

    fn get_monitor_data(&mut self) -> Result<Option<MonitorData>, anyhow::Error> {
        if !self.faulted {
            return Ok(None);
        }
        self.faulted = false;
        let (major, minor) = self.next_buckets();
        let risk = SEVERITY[self.rng.random_range(0..SEVERITY.len())];
        let capture: Vec<u8> = (0..64).map(|_| self.rng.random::<u8>()).collect();

        Ok(Some(MonitorData {
            title: Some("Random fault".to_string()),
            detection_source: None,
            fault: Some(FaultInfo {
                description: format!("Synthetic fault in bucket {major}/{minor}."),
                major_hash: Some(major),
                minor_hash: Some(minor),
                risk: Some(risk.to_string()),
                must_stop: false,
            }),
            data: vec![("BinaryData.bin".to_string(), capture)],
        }))
    }

    fn message(&mut self, msg: &str) -> Result<(), anyhow::Error> {
        match msg.to_ascii_lowercase().as_str() {
            "true" => self.is_control = true,
            "false" => self.is_control = false,
            _ => {}
        }
        Ok(())
    }
}

pub type MonitorFactory =
    Box<dyn Fn(&str, &HashMap<String, String>) -> anyhow::Result<Box<dyn Monitor>> + Send + Sync>;

/// Monitor classes the agent can start, keyed by class name. Factories receive
/// the monitor's name and its arguments.
pub struct MonitorCatalog {
    factories: HashMap<String, MonitorFactory>,
}

impl MonitorCatalog {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, class: &str, factory: F)
    where
        F: Fn(&str, &HashMap<String, String>) -> anyhow::Result<Box<dyn Monitor>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(class.to_string(), Box::new(factory));
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    pub fn create(
        &self,
        name: &str,
        class: &str,
        args: &HashMap<String, String>,
    ) -> anyhow::Result<Box<dyn Monitor>> {
        let factory = self
            .factories
            .get(class)
            .ok_or_else(|| anyhow!("Unknown monitor class '{class}'"))?;
        factory(name, args)
    }
}

impl Default for MonitorCatalog {
    fn default() -> Self {
        let mut catalog = Self::empty();
        catalog.register("Null", |_, _| Ok(Box::new(NullMonitor)));
        catalog.register("RandoFaulter", |_, args| {
            Ok(Box::new(RandoFaulter::from_args(args)?))
        });
        catalog
    }
}

/// A running monitor together with how it was configured.
pub struct ActiveMonitor {
    pub name: String,
    pub class: String,
    pub monitor: Box<dyn Monitor>,
}

/// The monitors of one agent session, in start order.
#[derive(Default)]
pub struct MonitorRegistry {
    active: Vec<ActiveMonitor>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.active.iter().any(|m| m.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.active.iter().map(|m| m.name.as_str()).collect()
    }

    /// Adds a started monitor. The caller checks for duplicates first.
    pub fn insert(&mut self, entry: ActiveMonitor) {
        self.active.push(entry);
    }

    pub fn remove(&mut self, name: &str) -> Option<ActiveMonitor> {
        let index = self.active.iter().position(|m| m.name == name)?;
        Some(self.active.remove(index))
    }

    /// Removes every monitor, most recently started first.
    pub fn drain(&mut self) -> Vec<ActiveMonitor> {
        let mut all: Vec<ActiveMonitor> = self.active.drain(..).collect();
        all.reverse();
        all
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ActiveMonitor> {
        self.active.iter_mut()
    }
}
