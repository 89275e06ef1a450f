use crate::channel::PublisherSession;
use crate::codec::{PublisherPayload, Reply};
use crate::command::{AgentCommand, Command, PublisherCommand, PublisherSpec, Request, Route};
use crate::config::SessionConfig;
use crate::error::AgentError;
use crate::monitor::MonitorCatalog;
use crate::publisher::{IterationContext, PublisherCatalog};
use crate::session::{AgentSession, AgentState, MustStopHandle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

type Channel = Arc<Mutex<PublisherSession>>;

/// A panic inside one request must not wedge the agent; the guarded state is
/// still structurally valid.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of an agent-family command before it is put in an envelope.
enum AgentOutcome {
    Done,
    Answer(bool),
    Records(Vec<crate::fault::FaultRecord>),
}

/// Routes requests to the agent session or to a named publisher session.
///
/// At most one agent session exists. `AgentConnect` replaces it, tearing down
/// every monitor and publisher of the previous one. The agent session and each
/// publisher session are locked independently, so commands for different
/// publishers can run concurrently.
pub struct Dispatcher {
    monitor_catalog: MonitorCatalog,
    publisher_catalog: PublisherCatalog,
    settings: SessionConfig,
    must_stop: MustStopHandle,
    agent: Mutex<Option<AgentSession>>,
    channels: Mutex<HashMap<String, Channel>>,
}

impl Dispatcher {
    pub fn new(settings: SessionConfig) -> Self {
        Self::with_catalogs(settings, MonitorCatalog::default(), PublisherCatalog::default())
    }

    pub fn with_catalogs(
        settings: SessionConfig,
        monitor_catalog: MonitorCatalog,
        publisher_catalog: PublisherCatalog,
    ) -> Self {
        Self {
            monitor_catalog,
            publisher_catalog,
            settings,
            must_stop: MustStopHandle::new(),
            agent: Mutex::new(None),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Handle for raising the must-stop flag from outside the request path.
    pub fn must_stop_handle(&self) -> MustStopHandle {
        self.must_stop.clone()
    }

    pub fn state(&self) -> AgentState {
        lock(&self.agent)
            .as_ref()
            .map_or(AgentState::Disconnected, AgentSession::state)
    }

    pub fn publisher_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.channels).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Decodes, executes and renders one request. Never panics on bad input.
    pub fn handle(&self, req: &Request) -> Reply {
        let Some(route) = Route::resolve(&req.path) else {
            return self.reject(&req.path, &AgentError::UnknownCommand(req.path.clone()));
        };
        if route.requires_connection() && self.state() == AgentState::Disconnected {
            return self.reject(&req.path, &Self::not_connected());
        }
        let reply = match route.decode(req) {
            Ok(Command::Agent(cmd)) => match self.run_agent(cmd) {
                Ok(AgentOutcome::Done) => Reply::status(true),
                Ok(AgentOutcome::Answer(value)) => Reply::status(value),
                Ok(AgentOutcome::Records(records)) => Reply::monitor_data(records),
                Err(e) => Reply::agent_error(&e),
            },
            Ok(Command::Publisher { id, command }) => match self.run_publisher(&id, command) {
                Ok(payload) => Reply::publisher_ok(payload),
                Err(e) => Reply::publisher_error(&e),
            },
            Err(e) => return self.reject(&req.path, &e),
        };
        if !reply.is_success() {
            debug!(path = %req.path, "Command failed");
        }
        reply
    }

    /// Renders an error that happened before the command could be decoded
    /// (for example an unparsable query string) in the envelope of the path's
    /// family.
    pub fn reject(&self, path: &str, err: &AgentError) -> Reply {
        warn!(path = %path, kind = err.kind(), error = %err, "Rejected request");
        match Route::resolve(path) {
            None => Reply::unknown_command(),
            Some(Route::Agent(_)) => Reply::agent_error(err),
            Some(Route::Publisher { .. }) => Reply::publisher_error(err),
        }
    }

    fn not_connected() -> AgentError {
        AgentError::invalid_state("agent is not connected")
    }

    /// Runs `f` against the connected agent session.
    fn with_session<T>(
        &self,
        f: impl FnOnce(&mut AgentSession) -> Result<T, AgentError>,
    ) -> Result<T, AgentError> {
        let mut agent = lock(&self.agent);
        let session = agent.as_mut().ok_or_else(Self::not_connected)?;
        f(session)
    }

    /// Closes and stops every publisher. Called with the agent lock held.
    fn drop_channels(&self) {
        let channels: Vec<(String, Channel)> = lock(&self.channels).drain().collect();
        for (_, channel) in channels {
            let mut publisher = lock(&*channel);
            debug!(publisher = %publisher.id(), class = publisher.class(), "Tearing down publisher");
            publisher.shutdown();
        }
    }

    fn connect(&self) {
        let mut agent = lock(&self.agent);
        if let Some(mut old) = agent.take() {
            info!("Replacing existing engine connection");
            old.teardown();
        }
        self.drop_channels();
        *agent = Some(AgentSession::connect(self.must_stop.clone()));
        info!("Engine connected");
    }

    fn disconnect(&self) -> Result<(), AgentError> {
        let mut agent = lock(&self.agent);
        let mut old = agent.take().ok_or_else(Self::not_connected)?;
        old.teardown();
        self.drop_channels();
        info!("Engine disconnected");
        Ok(())
    }

    fn run_agent(&self, cmd: AgentCommand) -> Result<AgentOutcome, AgentError> {
        match cmd {
            AgentCommand::Connect => {
                self.connect();
                Ok(AgentOutcome::Done)
            }
            AgentCommand::Disconnect => {
                self.disconnect()?;
                Ok(AgentOutcome::Done)
            }
            AgentCommand::CreatePublisher(spec) => {
                self.create_publisher(spec)?;
                Ok(AgentOutcome::Done)
            }
            AgentCommand::StartMonitor(spec) => self
                .with_session(|s| s.start_monitor(&self.monitor_catalog, spec))
                .map(|_| AgentOutcome::Done),
            AgentCommand::StopMonitor(name) => self
                .with_session(|s| s.stop_monitor(&name))
                .map(|_| AgentOutcome::Done),
            AgentCommand::StopAllMonitors => self
                .with_session(AgentSession::stop_all_monitors)
                .map(|_| AgentOutcome::Done),
            AgentCommand::SessionStarting => self
                .with_session(AgentSession::session_starting)
                .map(|_| AgentOutcome::Done),
            AgentCommand::SessionFinished => self
                .with_session(AgentSession::session_finished)
                .map(|_| AgentOutcome::Done),
            AgentCommand::IterationStarting(args) => self
                .with_session(|s| s.iteration_starting(args))
                .map(|_| AgentOutcome::Done),
            AgentCommand::IterationFinished => self
                .with_session(AgentSession::iteration_finished)
                .map(|_| AgentOutcome::Done),
            AgentCommand::DetectedFault => self
                .with_session(AgentSession::detected_fault)
                .map(AgentOutcome::Answer),
            AgentCommand::GetMonitorData => self
                .with_session(AgentSession::get_monitor_data)
                .map(AgentOutcome::Records),
            AgentCommand::MustStop => self
                .with_session(AgentSession::must_stop)
                .map(AgentOutcome::Answer),
            AgentCommand::Message(msg) => self
                .with_session(|s| s.message(&msg))
                .map(|_| AgentOutcome::Done),
        }
    }

    /// Creates the publisher named by `spec.id`, replacing any existing one.
    /// The agent lock is held until the publisher is registered, so a
    /// concurrent connect or disconnect cannot miss it.
    fn create_publisher(&self, spec: PublisherSpec) -> Result<(), AgentError> {
        let agent = lock(&self.agent);
        let iteration = agent.as_ref().ok_or_else(Self::not_connected)?.iteration();
        let class = spec
            .class
            .unwrap_or_else(|| self.settings.default_publisher.clone());
        let backend = self.publisher_catalog.create(&class, &spec.args)?;
        let context = IterationContext {
            iteration: spec.iteration.unwrap_or(iteration),
            control_iteration: spec.control_iteration.unwrap_or(false),
            control_recording_iteration: spec.control_recording_iteration.unwrap_or(false),
            iteration_after_fault: spec.iteration_after_fault.unwrap_or(false),
        };
        let session = PublisherSession::new(
            spec.id.clone(),
            backend,
            context,
            self.settings.max_input_buffer,
        );

        let previous = lock(&self.channels).insert(spec.id.clone(), Arc::new(Mutex::new(session)));
        if let Some(old) = previous {
            let mut replaced = lock(&*old);
            info!(
                publisher = %replaced.id(),
                class = replaced.class(),
                "Replacing existing publisher"
            );
            replaced.shutdown();
        }
        drop(agent);
        info!(publisher = %spec.id, class = %class, "Publisher created");
        Ok(())
    }

    fn channel(&self, id: &str) -> Result<Channel, AgentError> {
        lock(&self.channels)
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::invalid_state(format!("publisher '{id}' does not exist")))
    }

    fn run_publisher(
        &self,
        id: &str,
        command: PublisherCommand,
    ) -> Result<PublisherPayload, AgentError> {
        let command = match command {
            PublisherCommand::Create(spec) => {
                self.create_publisher(spec)?;
                return Ok(PublisherPayload::Empty {});
            }
            other => other,
        };

        // The publisher must exist before any agent-side iteration flag moves.
        let channel = {
            let mut agent = lock(&self.agent);
            let session = agent.as_mut().ok_or_else(Self::not_connected)?;
            let channel = self.channel(id)?;
            match &command {
                PublisherCommand::SetIteration(n) => session.set_iteration(*n),
                PublisherCommand::SetIsControlIteration(value) => {
                    session.set_control_iteration(*value)
                }
                PublisherCommand::SetIsControlRecordingIteration(value) => {
                    session.set_control_recording_iteration(*value)
                }
                _ => {}
            }
            channel
        };

        let mut publisher = lock(&*channel);
        let empty = PublisherPayload::Empty {};
        let payload = match command {
            PublisherCommand::Create(_) => empty,
            PublisherCommand::SetIteration(n) => {
                publisher.set_iteration(n);
                empty
            }
            PublisherCommand::SetIsControlIteration(value) => {
                publisher.set_control_iteration(value);
                empty
            }
            PublisherCommand::SetIsControlRecordingIteration(value) => {
                publisher.set_control_recording_iteration(value);
                empty
            }
            PublisherCommand::SetIsIterationAfterFault(value) => {
                publisher.set_iteration_after_fault(value);
                empty
            }
            PublisherCommand::GetResult => PublisherPayload::Value {
                value: publisher.get_result()?,
            },
            PublisherCommand::SetResult(value) => {
                publisher.set_result(value)?;
                empty
            }
            PublisherCommand::Start => {
                publisher.start()?;
                empty
            }
            PublisherCommand::Stop => {
                publisher.stop()?;
                empty
            }
            PublisherCommand::Open => {
                publisher.open()?;
                empty
            }
            PublisherCommand::Close => {
                publisher.close()?;
                empty
            }
            PublisherCommand::Accept => {
                publisher.accept()?;
                empty
            }
            PublisherCommand::Call { method, args } => PublisherPayload::Value {
                value: publisher.call(&method, &args)?,
            },
            PublisherCommand::SetProperty { name, value } => {
                publisher.set_property(&name, &value)?;
                empty
            }
            PublisherCommand::GetProperty(name) => PublisherPayload::Value {
                value: publisher.get_property(&name)?,
            },
            PublisherCommand::Output(data) => {
                publisher.output(&data)?;
                empty
            }
            PublisherCommand::Input => PublisherPayload::Data {
                data: Some(publisher.input()?),
            },
            PublisherCommand::WantBytes(count) => {
                publisher.want_bytes(count)?;
                empty
            }
            PublisherCommand::ReadBytes(count) => {
                let data = publisher.read_bytes(count)?;
                PublisherPayload::Read {
                    ready: data.is_some(),
                    data,
                }
            }
            PublisherCommand::ReadAllBytes => PublisherPayload::Data {
                data: Some(publisher.read_all_bytes()?),
            },
        };
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_base64;
    use crate::fault::{FaultInfo, MonitorData};
    use crate::monitor::{IterationStartingArgs, Monitor};
    use serde_json::{Value, json};

    /// Stand-in for a debugger monitor: faults on every iteration.
    struct CrashingDebugger {
        iteration: u32,
    }

    impl Monitor for CrashingDebugger {
        fn stop(&mut self) -> Result<(), anyhow::Error> {
            Ok(())
        }

        fn iteration_starting(
            &mut self,
            args: &IterationStartingArgs,
        ) -> Result<(), anyhow::Error> {
            self.iteration = args.iteration;
            Ok(())
        }

        fn iteration_finished(&mut self) -> Result<(), anyhow::Error> {
            Ok(())
        }

        fn detected_fault(&mut self) -> Result<bool, anyhow::Error> {
            Ok(self.iteration > 0)
        }

        fn get_monitor_data(&mut self) -> Result<Option<MonitorData>, anyhow::Error> {
            Ok(Some(MonitorData {
                title: Some("Access violation".into()),
                fault: Some(FaultInfo {
                    description: "Write to 0x41414141".into(),
                    risk: Some("EXPLOITABLE".into()),
                    ..Default::default()
                }),
                data: vec![("StackTrace.txt".into(), b"frame0".to_vec())],
                ..Default::default()
            }))
        }
    }

    fn dispatcher() -> Dispatcher {
        let mut monitors = MonitorCatalog::default();
        monitors.register("WindowsDebugger", |_, _| {
            Ok(Box::new(CrashingDebugger { iteration: 0 }))
        });
        let settings = SessionConfig {
            default_publisher: "Loopback".to_string(),
            ..Default::default()
        };
        Dispatcher::with_catalogs(settings, monitors, PublisherCatalog::default())
    }

    fn send(d: &Dispatcher, path: &str, body: Value) -> Value {
        let body = if body.is_null() {
            Vec::new()
        } else {
            body.to_string().into_bytes()
        };
        d.handle(&Request::new(path).with_body(body)).to_json()
    }

    fn send_query(d: &Dispatcher, path: &str, query: &[(&str, &str)]) -> Value {
        let mut req = Request::new(path);
        for (k, v) in query {
            req = req.with_query(k, v);
        }
        d.handle(&req).to_json()
    }

    fn ok() -> Value {
        json!({"Status": true})
    }

    fn pub_ok() -> Value {
        json!({"error": false, "errorString": null})
    }

    fn is_invalid_state(reply: &Value) -> bool {
        let reason = reply["Reason"].as_str().or(reply["errorString"].as_str());
        reason.is_some_and(|r| r.starts_with("Invalid state"))
    }

    #[test]
    fn everything_but_connect_requires_a_connection() {
        let d = dispatcher();
        let paths = [
            "/Agent/AgentDisconnect",
            "/Agent/CreatePublisher",
            "/Agent/StopAllMonitors",
            "/Agent/SessionStarting",
            "/Agent/SessionFinished",
            "/Agent/IterationStarting",
            "/Agent/IterationFinished",
            "/Agent/DetectedFault",
            "/Agent/GetMonitorData",
            "/Agent/MustStop",
            "/Agent/Message",
            "/Agent/Publisher/CreatePublisher",
            "/Agent/Publisher/Set_Iteration",
            "/Agent/Publisher/start",
            "/Agent/Publisher/open",
            "/Agent/Publisher/close",
            "/Agent/Publisher/input",
            "/Agent/Publisher/ReadAllBytes",
            "/Agent/StartMonitor",
            "/Agent/StopMonitor",
            "/Agent/Publisher/Set_IsControlIteration",
            "/Agent/Publisher/Set_Result",
            "/Agent/Publisher/call",
            "/Agent/Publisher/setProperty",
            "/Agent/Publisher/getProperty",
            "/Agent/Publisher/output",
            "/Agent/Publisher/WantBytes",
            "/Agent/Publisher/ReadBytes/net",
        ];
        for path in paths {
            let reply = send(&d, path, Value::Null);
            assert!(
                is_invalid_state(&reply),
                "{path} before AgentConnect should be InvalidState, got {reply}"
            );
        }
        let reply = send(&d, "/Agent/Publisher/Set_Iteration", json!({"iteration": 1}));
        assert!(is_invalid_state(&reply));
        let reply = send_query(&d, "/Agent/StartMonitor", &[("name", "m"), ("cls", "Null")]);
        assert!(is_invalid_state(&reply));
        let reply = send_query(&d, "/Agent/StopMonitor", &[("name", "m")]);
        assert!(is_invalid_state(&reply));
        assert_eq!(d.state(), AgentState::Disconnected);
    }

    #[test]
    fn duplicate_monitor_and_idempotent_stops() {
        let d = dispatcher();
        assert_eq!(send(&d, "/Agent/AgentConnect", Value::Null), ok());
        let start = |cls: &str| {
            send_query(&d, "/Agent/StartMonitor", &[("name", "m"), ("cls", cls)])
        };
        assert_eq!(start("Null"), ok());
        let dup = start("RandoFaulter");
        assert_eq!(dup["Status"], false);
        assert!(dup["Reason"].as_str().unwrap().contains("already started"));

        assert_eq!(send_query(&d, "/Agent/StopMonitor", &[("name", "m")]), ok());
        assert_eq!(send_query(&d, "/Agent/StopMonitor", &[("name", "m")]), ok());
        assert_eq!(start("RandoFaulter"), ok());
        assert_eq!(send(&d, "/Agent/StopAllMonitors", Value::Null), ok());
        assert_eq!(send(&d, "/Agent/StopAllMonitors", Value::Null), ok());
    }

    #[test]
    fn publisher_io_requires_open() {
        let d = dispatcher();
        send(&d, "/Agent/AgentConnect", Value::Null);
        assert_eq!(send(&d, "/Agent/CreatePublisher", Value::Null), ok());
        assert_eq!(d.publisher_ids(), vec!["default"]);

        let call = json!({"method": "send", "args": [{"name": "buf", "type": "bytes", "data": "QUFB"}]});
        let output = json!({"data": "AAEC"});
        let prop = json!({"property": "Host", "data": "aG9zdA=="});

        for (path, body) in [
            ("/Agent/Publisher/call", &call),
            ("/Agent/Publisher/output", &output),
            ("/Agent/Publisher/setProperty", &prop),
        ] {
            let reply = send(&d, path, body.clone());
            assert_eq!(reply["error"], true, "{path} before open should fail");
            assert!(is_invalid_state(&reply));
        }

        assert_eq!(send(&d, "/Agent/Publisher/start", Value::Null), pub_ok());
        assert_eq!(send(&d, "/Agent/Publisher/open", Value::Null), pub_ok());
        assert_eq!(
            send(&d, "/Agent/Publisher/call", call),
            json!({"error": false, "errorString": null, "value": "QUFB"})
        );
        assert_eq!(send(&d, "/Agent/Publisher/output", output), pub_ok());
        assert_eq!(send(&d, "/Agent/Publisher/setProperty", prop), pub_ok());
        assert_eq!(
            send(&d, "/Agent/Publisher/getProperty", json!("Host")),
            json!({"error": false, "errorString": null, "value": "aG9zdA=="})
        );
    }

    #[test]
    fn want_and_read_bytes_poll_until_data_arrives() {
        let d = dispatcher();
        send(&d, "/Agent/AgentConnect", Value::Null);
        send(&d, "/Agent/CreatePublisher", Value::Null);
        send(&d, "/Agent/Publisher/start", Value::Null);
        send(&d, "/Agent/Publisher/open", Value::Null);

        assert_eq!(send(&d, "/Agent/Publisher/WantBytes", json!({"count": 10})), pub_ok());
        assert_eq!(
            send(&d, "/Agent/Publisher/ReadBytes", json!({"count": 10})),
            json!({"error": false, "errorString": null, "data": null, "ready": false})
        );

        let payload: Vec<u8> = (0u8..12).collect();
        send(
            &d,
            "/Agent/Publisher/output",
            json!({"data": encode_base64(&payload)}),
        );
        assert_eq!(
            send(&d, "/Agent/Publisher/ReadBytes", json!({"count": 10})),
            json!({"error": false, "errorString": null, "data": encode_base64(&payload[..10]), "ready": true})
        );
        assert_eq!(
            send(&d, "/Agent/Publisher/ReadAllBytes", Value::Null),
            json!({"error": false, "errorString": null, "data": encode_base64(&payload[10..])})
        );
    }

    #[test]
    fn read_all_then_output_round_trips_bytes() {
        let d = dispatcher();
        send(&d, "/Agent/AgentConnect", Value::Null);
        send(&d, "/Agent/CreatePublisher", Value::Null);
        send(&d, "/Agent/Publisher/start", Value::Null);
        send(&d, "/Agent/Publisher/open", Value::Null);

        let drained = send(&d, "/Agent/Publisher/ReadAllBytes", Value::Null);
        assert_eq!(drained["data"], "");
        assert_eq!(send(&d, "/Agent/Publisher/input", Value::Null)["data"], "");

        let bytes: Vec<u8> = (0..=255u8).rev().collect();
        send(&d, "/Agent/Publisher/output", json!({"data": encode_base64(&bytes)}));
        let echoed = send(&d, "/Agent/Publisher/ReadAllBytes", Value::Null);
        assert_eq!(echoed["data"], encode_base64(&bytes));
    }

    #[test]
    fn reconnect_tears_down_previous_session() {
        let d = dispatcher();
        send(&d, "/Agent/AgentConnect", Value::Null);
        send_query(&d, "/Agent/StartMonitor", &[("name", "old"), ("cls", "Null")]);
        send(&d, "/Agent/CreatePublisher", json!({"name": "net"}));
        send(&d, "/Agent/Publisher/start/net", Value::Null);
        send(&d, "/Agent/SessionStarting", Value::Null);

        assert_eq!(send(&d, "/Agent/AgentConnect", Value::Null), ok());
        assert_eq!(d.state(), AgentState::Connected);
        assert!(d.publisher_ids().is_empty(), "Old publishers must be gone");
        let reply = send(&d, "/Agent/Publisher/open/net", Value::Null);
        assert!(is_invalid_state(&reply));

        send_query(&d, "/Agent/StartMonitor", &[("name", "new"), ("cls", "Null")]);
        assert_eq!(send_query(&d, "/Agent/StopMonitor", &[("name", "old")]), ok());
        let dup = send_query(&d, "/Agent/StartMonitor", &[("name", "new"), ("cls", "Null")]);
        assert_eq!(dup["Status"], false, "Monitor of the new session must survive");

        assert_eq!(send(&d, "/Agent/AgentDisconnect", Value::Null), ok());
        assert_eq!(d.state(), AgentState::Disconnected);
    }

    #[test]
    fn create_publisher_replaces_existing_and_picks_class() {
        let d = dispatcher();
        send(&d, "/Agent/AgentConnect", Value::Null);
        send(&d, "/Agent/Publisher/CreatePublisher", Value::Null);
        send(&d, "/Agent/Publisher/start", Value::Null);
        assert_eq!(
            send(&d, "/Agent/Publisher/CreatePublisher", json!({"Cls": "Null"})),
            pub_ok()
        );
        assert_eq!(
            send(&d, "/Agent/Publisher/start", Value::Null),
            pub_ok(),
            "The replacement starts from Created"
        );

        let unknown = send(&d, "/Agent/Publisher/CreatePublisher/x", json!({"Cls": "Serial"}));
        assert_eq!(unknown["error"], true);
        assert!(unknown["errorString"].as_str().unwrap().contains("Serial"));
    }

    #[test]
    fn publisher_iteration_updates_reach_the_session() {
        let d = dispatcher();
        send(&d, "/Agent/AgentConnect", Value::Null);
        send_query(&d, "/Agent/StartMonitor", &[("name", "dbg"), ("cls", "WindowsDebugger")]);
        send(&d, "/Agent/CreatePublisher", Value::Null);
        send(&d, "/Agent/SessionStarting", Value::Null);
        send_query(&d, "/Agent/IterationStarting", &[("iterationCount", "1")]);
        send(&d, "/Agent/Publisher/Set_Iteration", json!({"iteration": 17}));
        send(&d, "/Agent/Publisher/Set_IsControlIteration", json!({"isControlIteration": true}));
        send(&d, "/Agent/IterationFinished", Value::Null);

        let data = send(&d, "/Agent/GetMonitorData", Value::Null);
        assert_eq!(data["Results"][0]["iteration"], 17);
        assert_eq!(data["Results"][0]["controlIteration"], true);
    }

    #[test]
    fn iteration_update_for_missing_publisher_changes_nothing() {
        let d = dispatcher();
        send(&d, "/Agent/AgentConnect", Value::Null);
        send_query(&d, "/Agent/StartMonitor", &[("name", "dbg"), ("cls", "WindowsDebugger")]);
        send(&d, "/Agent/SessionStarting", Value::Null);
        send_query(&d, "/Agent/IterationStarting", &[("iterationCount", "1")]);

        for (path, body) in [
            ("/Agent/Publisher/Set_Iteration/nosuch", json!({"iteration": 99})),
            (
                "/Agent/Publisher/Set_IsControlIteration/nosuch",
                json!({"isControlIteration": true}),
            ),
        ] {
            let reply = send(&d, path, body);
            assert_eq!(reply["error"], true);
            assert!(is_invalid_state(&reply), "{path}: {reply}");
        }
        send(&d, "/Agent/IterationFinished", Value::Null);

        let data = send(&d, "/Agent/GetMonitorData", Value::Null);
        assert_eq!(data["Results"][0]["iteration"], 1);
        assert_eq!(data["Results"][0]["controlIteration"], false);
    }

    #[test]
    fn publishers_never_outlive_a_concurrent_disconnect() {
        let d = dispatcher();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..200 {
                    let name = format!("p{i}");
                    send(&d, "/Agent/CreatePublisher", json!({"name": name}));
                    send(&d, &format!("/Agent/Publisher/CreatePublisher/q{i}"), Value::Null);
                }
            });
            scope.spawn(|| {
                for _ in 0..200 {
                    send(&d, "/Agent/AgentConnect", Value::Null);
                    send(&d, "/Agent/AgentDisconnect", Value::Null);
                }
            });
        });
        assert_eq!(d.state(), AgentState::Disconnected);
        assert!(
            d.publisher_ids().is_empty(),
            "Publishers left behind after disconnect: {:?}",
            d.publisher_ids()
        );
    }

    #[test]
    fn decode_errors_use_the_family_envelope() {
        let d = dispatcher();
        send(&d, "/Agent/AgentConnect", Value::Null);
        let agent = send_query(&d, "/Agent/IterationStarting", &[("iterationCount", "many")]);
        assert_eq!(agent["Status"], false);
        assert!(agent["Reason"].as_str().unwrap().starts_with("Decode error"));

        let publisher = d
            .handle(&Request::new("/Agent/Publisher/output").with_body("{not json"))
            .to_json();
        assert_eq!(publisher["error"], true);

        let rejected = d
            .reject(
                "/Agent/Publisher/open",
                &AgentError::Decode("bad query".into()),
            )
            .to_json();
        assert_eq!(rejected["error"], true);
        assert_eq!(
            d.reject("/Nope", &AgentError::Decode("x".into())).to_json(),
            json!({"Error": "Error, unknown command."})
        );
    }

    #[test]
    fn unknown_path_gets_generic_error_and_service_continues() {
        let d = dispatcher();
        assert_eq!(
            send(&d, "/Agent/Bogus", Value::Null),
            json!({"Error": "Error, unknown command."})
        );
        assert_eq!(send(&d, "/Agent/AgentConnect", Value::Null), ok());
    }

    #[test]
    fn must_stop_handle_is_visible_to_the_engine() {
        let d = dispatcher();
        send(&d, "/Agent/AgentConnect", Value::Null);
        assert_eq!(send(&d, "/Agent/MustStop", Value::Null), json!({"Status": false}));
        d.must_stop_handle().raise();
        assert_eq!(send(&d, "/Agent/MustStop", Value::Null), ok());
    }

    #[test]
    fn end_to_end_fault_scenario() {
        let d = dispatcher();
        let steps: Vec<(&str, Vec<(&str, &str)>, Value, Value)> = vec![
            ("/Agent/AgentConnect", vec![], Value::Null, ok()),
            ("/Agent/CreatePublisher", vec![], Value::Null, ok()),
            (
                "/Agent/StartMonitor",
                vec![("name", "dbg"), ("cls", "WindowsDebugger")],
                json!({"args": {"CommandLine": "target.exe fuzzed.bin"}}),
                ok(),
            ),
            ("/Agent/SessionStarting", vec![], Value::Null, ok()),
            (
                "/Agent/IterationStarting",
                vec![("iterationCount", "1"), ("isReproduction", "false")],
                Value::Null,
                ok(),
            ),
            ("/Agent/Publisher/start", vec![], Value::Null, pub_ok()),
            ("/Agent/Publisher/open", vec![], Value::Null, pub_ok()),
            (
                "/Agent/Publisher/call",
                vec![],
                json!({"method": "send", "args": [{"name": "buf", "type": "bytes", "data": "QUFB"}]}),
                json!({"error": false, "errorString": null, "value": "QUFB"}),
            ),
            ("/Agent/IterationFinished", vec![], Value::Null, ok()),
            ("/Agent/DetectedFault", vec![], Value::Null, ok()),
        ];
        for (path, query, body, expected) in steps {
            let mut req = Request::new(path);
            for (k, v) in &query {
                req = req.with_query(k, v);
            }
            if !body.is_null() {
                req = req.with_body(body.to_string());
            }
            assert_eq!(d.handle(&req).to_json(), expected, "step {path}");
        }

        let data = send(&d, "/Agent/GetMonitorData", Value::Null);
        let results = data["Results"].as_array().expect("Results array");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["iteration"], 1);
        assert_eq!(results[0]["type"], 1);
        assert_eq!(results[0]["detectionSource"], "WindowsDebugger");
        assert_eq!(results[0]["exploitability"], "EXPLOITABLE");
        assert_eq!(results[0]["collectedData"][0]["Key"], "StackTrace.txt");
        assert_eq!(results[0]["collectedData"][0]["Value"], encode_base64(b"frame0"));

        for path in [
            "/Agent/SessionFinished",
            "/Agent/StopAllMonitors",
            "/Agent/AgentDisconnect",
        ] {
            assert_eq!(send(&d, path, Value::Null), ok(), "step {path}");
        }
    }
}
