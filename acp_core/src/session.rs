use crate::command::MonitorSpec;
use crate::error::AgentError;
use crate::fault::{FaultRecord, RecordContext};
use crate::monitor::{ActiveMonitor, IterationStartingArgs, Monitor, MonitorCatalog, MonitorRegistry};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Lifecycle of the engine connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Connected,
    SessionActive,
    Iterating,
}

/// Shared must-stop flag. Clones observe the same flag, so the host process
/// can ask the engine to stop from outside the request path.
#[derive(Debug, Clone, Default)]
pub struct MustStopHandle(Arc<AtomicBool>);

impl MustStopHandle {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn monitor_error(name: &str, hook: &str, err: anyhow::Error) -> AgentError {
    AgentError::Collaborator(format!("Monitor '{name}' failed in {hook}: {err:#}"))
}

/// Runs `hook` on every monitor in start order. All monitors are notified even
/// when one fails; the first failure is returned.
fn notify_all<F>(registry: &mut MonitorRegistry, hook: &str, mut f: F) -> Result<(), AgentError>
where
    F: FnMut(&mut dyn Monitor) -> Result<(), anyhow::Error>,
{
    let mut first_error = None;
    for entry in registry.iter_mut() {
        if let Err(e) = f(entry.monitor.as_mut()) {
            warn!(monitor = %entry.name, hook, error = %e, "Monitor hook failed");
            first_error.get_or_insert_with(|| monitor_error(&entry.name, hook, e));
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Asks every monitor in start order and collects the answers. Failures are
/// logged and skipped; the call fails only when monitors exist and none of
/// them answered.
fn poll_all<T, F>(registry: &mut MonitorRegistry, hook: &str, mut f: F) -> Result<Vec<T>, AgentError>
where
    F: FnMut(&mut ActiveMonitor) -> Result<T, anyhow::Error>,
{
    let mut answers = Vec::new();
    let mut first_error = None;
    for entry in registry.iter_mut() {
        match f(&mut *entry) {
            Ok(answer) => answers.push(answer),
            Err(e) => {
                warn!(monitor = %entry.name, hook, error = %e, "Monitor hook failed");
                first_error.get_or_insert_with(|| monitor_error(&entry.name, hook, e));
            }
        }
    }
    match first_error {
        Some(err) if answers.is_empty() => Err(err),
        _ => Ok(answers),
    }
}

/// State of the single connected engine: its monitors, the run/iteration
/// bracket it is in and the iteration flags it reported.
pub struct AgentSession {
    state: AgentState,
    iteration: u32,
    control_iteration: bool,
    control_recording_iteration: bool,
    data_delivered: bool,
    monitors: MonitorRegistry,
    must_stop: MustStopHandle,
}

impl AgentSession {
    pub fn connect(must_stop: MustStopHandle) -> Self {
        must_stop.clear();
        Self {
            state: AgentState::Connected,
            iteration: 0,
            control_iteration: false,
            control_recording_iteration: false,
            data_delivered: false,
            monitors: MonitorRegistry::new(),
            must_stop,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn monitor_names(&self) -> Vec<&str> {
        self.monitors.names()
    }

    pub fn has_monitor(&self, name: &str) -> bool {
        self.monitors.contains(name)
    }

    pub fn set_iteration(&mut self, iteration: u32) {
        self.iteration = iteration;
    }

    pub fn set_control_iteration(&mut self, value: bool) {
        self.control_iteration = value;
    }

    pub fn set_control_recording_iteration(&mut self, value: bool) {
        self.control_recording_iteration = value;
    }

    pub fn start_monitor(
        &mut self,
        catalog: &MonitorCatalog,
        spec: MonitorSpec,
    ) -> Result<(), AgentError> {
        if self.monitors.contains(&spec.name) {
            return Err(AgentError::DuplicateMonitor(spec.name));
        }
        let monitor = catalog
            .create(&spec.name, &spec.class, &spec.args)
            .map_err(|e| monitor_error(&spec.name, "start", e))?;
        info!(monitor = %spec.name, class = %spec.class, "Monitor started");
        self.monitors.insert(ActiveMonitor {
            name: spec.name,
            class: spec.class,
            monitor,
        });
        Ok(())
    }

    /// Unknown names are a successful no-op.
    pub fn stop_monitor(&mut self, name: &str) -> Result<(), AgentError> {
        let Some(mut entry) = self.monitors.remove(name) else {
            debug!(monitor = %name, "StopMonitor for a monitor that is not running");
            return Ok(());
        };
        info!(monitor = %name, "Monitor stopped");
        entry
            .monitor
            .stop()
            .map_err(|e| monitor_error(&entry.name, "stop", e))
    }

    pub fn stop_all_monitors(&mut self) -> Result<(), AgentError> {
        let mut first_error = None;
        for mut entry in self.monitors.drain() {
            if let Err(e) = entry.monitor.stop() {
                warn!(monitor = %entry.name, error = %e, "Monitor failed to stop");
                first_error.get_or_insert_with(|| monitor_error(&entry.name, "stop", e));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn session_starting(&mut self) -> Result<(), AgentError> {
        if self.state != AgentState::Connected {
            return Err(AgentError::invalid_state(format!(
                "SessionStarting while {:?}",
                self.state
            )));
        }
        self.state = AgentState::SessionActive;
        info!("Fuzzing session starting");
        notify_all(&mut self.monitors, "session_starting", |m| m.session_starting())
    }

    pub fn session_finished(&mut self) -> Result<(), AgentError> {
        match self.state {
            AgentState::SessionActive | AgentState::Iterating => {
                self.state = AgentState::Connected;
                info!("Fuzzing session finished");
                notify_all(&mut self.monitors, "session_finished", |m| m.session_finished())
            }
            other => Err(AgentError::invalid_state(format!(
                "SessionFinished while {other:?}"
            ))),
        }
    }

    pub fn iteration_starting(&mut self, args: IterationStartingArgs) -> Result<(), AgentError> {
        if !matches!(
            self.state,
            AgentState::SessionActive | AgentState::Iterating
        ) {
            return Err(AgentError::invalid_state(format!(
                "IterationStarting while {:?}",
                self.state
            )));
        }
        if self.state == AgentState::Iterating {
            warn!(iteration = self.iteration, "IterationStarting without IterationFinished");
        }
        self.state = AgentState::Iterating;
        self.iteration = args.iteration;
        self.data_delivered = false;
        debug!(
            iteration = args.iteration,
            reproduction = args.is_reproduction,
            last_was_fault = args.last_was_fault,
            "Iteration starting"
        );
        notify_all(&mut self.monitors, "iteration_starting", |m| {
            m.iteration_starting(&args)
        })
    }

    /// Outside an iteration but inside a session this is a no-op.
    pub fn iteration_finished(&mut self) -> Result<(), AgentError> {
        match self.state {
            AgentState::Iterating => {
                self.state = AgentState::SessionActive;
                debug!(iteration = self.iteration, "Iteration finished");
                notify_all(&mut self.monitors, "iteration_finished", |m| {
                    m.iteration_finished()
                })
            }
            AgentState::SessionActive => {
                warn!("IterationFinished without a matching IterationStarting");
                Ok(())
            }
            other => Err(AgentError::invalid_state(format!(
                "IterationFinished while {other:?}"
            ))),
        }
    }

    /// Asks every monitor; any one reporting a fault marks the iteration
    /// faulted.
    pub fn detected_fault(&mut self) -> Result<bool, AgentError> {
        let iteration = self.iteration;
        let answers = poll_all(&mut self.monitors, "detected_fault", |entry| {
            let faulted = entry.monitor.detected_fault()?;
            if faulted {
                info!(monitor = %entry.name, iteration, "Fault detected");
            }
            Ok(faulted)
        })?;
        Ok(answers.into_iter().any(|f| f))
    }

    /// Collects records for the current iteration. Records are handed out at
    /// most once per iteration; later calls return an empty list.
    pub fn get_monitor_data(&mut self) -> Result<Vec<FaultRecord>, AgentError> {
        if self.data_delivered {
            return Ok(Vec::new());
        }
        let ctx = RecordContext {
            iteration: self.iteration,
            control_iteration: self.control_iteration,
            control_recording_iteration: self.control_recording_iteration,
        };
        let must_stop = &self.must_stop;
        let answers = poll_all(&mut self.monitors, "get_monitor_data", |entry| {
            let Some(data) = entry.monitor.get_monitor_data()? else {
                return Ok(None);
            };
            if data.fault.as_ref().is_some_and(|f| f.must_stop) {
                info!(monitor = %entry.name, "Monitor requested the run to stop");
                must_stop.raise();
            }
            Ok(Some(FaultRecord::from_monitor_data(data, ctx, &entry.class)))
        })?;
        self.data_delivered = true;
        Ok(answers.into_iter().flatten().collect())
    }

    pub fn must_stop(&mut self) -> Result<bool, AgentError> {
        let raised = self.must_stop.is_raised();
        let answers = poll_all(&mut self.monitors, "must_stop", |entry| entry.monitor.must_stop())?;
        Ok(raised || answers.into_iter().any(|stop| stop))
    }

    pub fn message(&mut self, msg: &str) -> Result<(), AgentError> {
        info!(text = %msg, "Message from engine");
        notify_all(&mut self.monitors, "message", |m| m.message(msg))
    }

    /// Stops every monitor, logging failures, and marks the session
    /// disconnected.
    pub fn teardown(&mut self) {
        if let Err(e) = self.stop_all_monitors() {
            warn!(error = %e, "Monitor teardown incomplete");
        }
        self.state = AgentState::Disconnected;
    }
}
