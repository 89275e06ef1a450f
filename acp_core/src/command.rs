use crate::codec::{
    CallArgument, CallBody, CountBody, CreatePublisherBody, DataBody, GetPropertyBody,
    IterationStartingBody, SetIsControlIterationBody, SetIsControlRecordingIterationBody,
    SetIsIterationAfterFaultBody, SetIterationBody, SetPropertyBody, SetResultBody,
    StartMonitorBody, StopMonitorBody, parse_body, parse_bool,
};
use crate::error::AgentError;
use crate::monitor::IterationStartingArgs;
use std::collections::HashMap;

/// Root path segment shared by every command.
pub const AGENT_PREFIX: &str = "Agent";
/// Second path segment selecting the publisher family.
pub const PUBLISHER_SEGMENT: &str = "Publisher";
/// Publisher addressed when the path carries no identifier segment.
pub const DEFAULT_PUBLISHER_ID: &str = "default";

/// An inbound request as the transport saw it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        self.query.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentCommandKind {
    AgentConnect,
    AgentDisconnect,
    CreatePublisher,
    StartMonitor,
    StopMonitor,
    StopAllMonitors,
    SessionStarting,
    SessionFinished,
    IterationStarting,
    IterationFinished,
    DetectedFault,
    GetMonitorData,
    MustStop,
    Message,
}

const AGENT_COMMANDS: &[(&str, AgentCommandKind)] = &[
    ("AgentConnect", AgentCommandKind::AgentConnect),
    ("AgentDisconnect", AgentCommandKind::AgentDisconnect),
    ("CreatePublisher", AgentCommandKind::CreatePublisher),
    ("StartMonitor", AgentCommandKind::StartMonitor),
    ("StopMonitor", AgentCommandKind::StopMonitor),
    ("StopAllMonitors", AgentCommandKind::StopAllMonitors),
    ("SessionStarting", AgentCommandKind::SessionStarting),
    ("SessionFinished", AgentCommandKind::SessionFinished),
    ("IterationStarting", AgentCommandKind::IterationStarting),
    ("IterationFinished", AgentCommandKind::IterationFinished),
    ("DetectedFault", AgentCommandKind::DetectedFault),
    ("GetMonitorData", AgentCommandKind::GetMonitorData),
    ("MustStop", AgentCommandKind::MustStop),
    ("Message", AgentCommandKind::Message),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublisherCommandKind {
    CreatePublisher,
    SetIteration,
    SetIsControlIteration,
    SetIsControlRecordingIteration,
    SetIsIterationAfterFault,
    GetResult,
    SetResult,
    Start,
    Stop,
    Open,
    Close,
    Accept,
    Call,
    SetProperty,
    GetProperty,
    Output,
    Input,
    WantBytes,
    ReadBytes,
    ReadAllBytes,
}

const PUBLISHER_COMMANDS: &[(&str, PublisherCommandKind)] = &[
    ("CreatePublisher", PublisherCommandKind::CreatePublisher),
    ("Set_Iteration", PublisherCommandKind::SetIteration),
    ("Set_IsControlIteration", PublisherCommandKind::SetIsControlIteration),
    (
        "Set_IsControlRecordingIteration",
        PublisherCommandKind::SetIsControlRecordingIteration,
    ),
    (
        "Set_IsIterationAfterFault",
        PublisherCommandKind::SetIsIterationAfterFault,
    ),
    ("Get_Result", PublisherCommandKind::GetResult),
    ("Set_Result", PublisherCommandKind::SetResult),
    ("start", PublisherCommandKind::Start),
    ("stop", PublisherCommandKind::Stop),
    ("open", PublisherCommandKind::Open),
    ("close", PublisherCommandKind::Close),
    ("accept", PublisherCommandKind::Accept),
    ("call", PublisherCommandKind::Call),
    ("setProperty", PublisherCommandKind::SetProperty),
    ("getProperty", PublisherCommandKind::GetProperty),
    ("output", PublisherCommandKind::Output),
    ("input", PublisherCommandKind::Input),
    ("WantBytes", PublisherCommandKind::WantBytes),
    ("ReadBytes", PublisherCommandKind::ReadBytes),
    ("ReadAllBytes", PublisherCommandKind::ReadAllBytes),
];

fn lookup<K: Copy>(table: &[(&str, K)], name: &str) -> Option<K> {
    table.iter().find(|(n, _)| *n == name).map(|(_, k)| *k)
}

/// Which handler a path selects, before the body is looked at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Agent(AgentCommandKind),
    Publisher {
        kind: PublisherCommandKind,
        id: String,
    },
}

impl Route {
    /// Resolves `/Agent/<Name>`, `/Agent/Publisher/<Name>` and
    /// `/Agent/Publisher/<Name>/<id>`. Query strings and trailing slashes are
    /// ignored.
    pub fn resolve(path: &str) -> Option<Route> {
        let path = path.split('?').next().unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match segments.as_slice() {
            [AGENT_PREFIX, PUBLISHER_SEGMENT, name] => Some(Route::Publisher {
                kind: lookup(PUBLISHER_COMMANDS, name)?,
                id: DEFAULT_PUBLISHER_ID.to_string(),
            }),
            [AGENT_PREFIX, PUBLISHER_SEGMENT, name, id] => Some(Route::Publisher {
                kind: lookup(PUBLISHER_COMMANDS, name)?,
                id: id.to_string(),
            }),
            [AGENT_PREFIX, name] => lookup(AGENT_COMMANDS, name).map(Route::Agent),
            [AGENT_PREFIX, "CreatePublisher", _id] => {
                Some(Route::Agent(AgentCommandKind::CreatePublisher))
            }
            _ => None,
        }
    }

    /// Everything except `AgentConnect` needs a connected engine.
    pub fn requires_connection(&self) -> bool {
        !matches!(self, Route::Agent(AgentCommandKind::AgentConnect))
    }

    /// Decodes the query and body into a typed command for this route.
    pub fn decode(&self, req: &Request) -> Result<Command, AgentError> {
        match self {
            Route::Agent(kind) => decode_agent(*kind, req).map(Command::Agent),
            Route::Publisher { kind, id } => Ok(Command::Publisher {
                id: id.clone(),
                command: decode_publisher(*kind, id, req)?,
            }),
        }
    }
}

/// Everything needed to instantiate a publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherSpec {
    pub id: String,
    /// `None` selects the configured default class.
    pub class: Option<String>,
    pub args: HashMap<String, String>,
    pub iteration: Option<u32>,
    pub control_iteration: Option<bool>,
    pub control_recording_iteration: Option<bool>,
    pub iteration_after_fault: Option<bool>,
}

impl PublisherSpec {
    fn from_body(id: String, body: CreatePublisherBody) -> Self {
        Self {
            id,
            class: body.class,
            args: body.args,
            iteration: body.iteration,
            control_iteration: body.is_control_iteration,
            control_recording_iteration: body.is_control_recording_iteration,
            iteration_after_fault: body.is_iteration_after_fault,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSpec {
    pub name: String,
    pub class: String,
    pub args: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCommand {
    Connect,
    Disconnect,
    CreatePublisher(PublisherSpec),
    StartMonitor(MonitorSpec),
    StopMonitor(String),
    StopAllMonitors,
    SessionStarting,
    SessionFinished,
    IterationStarting(IterationStartingArgs),
    IterationFinished,
    DetectedFault,
    GetMonitorData,
    MustStop,
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublisherCommand {
    Create(PublisherSpec),
    SetIteration(u32),
    SetIsControlIteration(bool),
    SetIsControlRecordingIteration(bool),
    SetIsIterationAfterFault(bool),
    GetResult,
    SetResult(Option<Vec<u8>>),
    Start,
    Stop,
    Open,
    Close,
    Accept,
    Call {
        method: String,
        args: Vec<CallArgument>,
    },
    SetProperty {
        name: String,
        value: Vec<u8>,
    },
    GetProperty(String),
    Output(Vec<u8>),
    Input,
    WantBytes(usize),
    ReadBytes(usize),
    ReadAllBytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Agent(AgentCommand),
    Publisher {
        id: String,
        command: PublisherCommand,
    },
}

fn required(value: Option<String>, what: &str) -> Result<String, AgentError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AgentError::Decode(format!("missing '{what}'")))
}

fn query_bool(req: &Request, key: &str) -> Result<Option<bool>, AgentError> {
    req.query
        .get(key)
        .map(|v| parse_bool(key, v))
        .transpose()
}

fn to_count(count: u64) -> Result<usize, AgentError> {
    usize::try_from(count).map_err(|_| AgentError::Decode(format!("count {count} out of range")))
}

fn decode_agent(kind: AgentCommandKind, req: &Request) -> Result<AgentCommand, AgentError> {
    let command = match kind {
        AgentCommandKind::AgentConnect => AgentCommand::Connect,
        AgentCommandKind::AgentDisconnect => AgentCommand::Disconnect,
        AgentCommandKind::CreatePublisher => {
            let body: CreatePublisherBody = parse_body(&req.body)?;
            let from_path = req
                .path
                .split('?')
                .next()
                .and_then(|p| p.split('/').filter(|s| !s.is_empty()).nth(2))
                .map(str::to_string);
            let id = body
                .name
                .clone()
                .or(from_path)
                .unwrap_or_else(|| DEFAULT_PUBLISHER_ID.to_string());
            AgentCommand::CreatePublisher(PublisherSpec::from_body(id, body))
        }
        AgentCommandKind::StartMonitor => {
            let body: StartMonitorBody = parse_body(&req.body)?;
            let name = required(body.name.or_else(|| req.query.get("name").cloned()), "name")?;
            let class = required(
                body.class
                    .or_else(|| req.query.get("cls").cloned())
                    .or_else(|| req.query.get("class").cloned()),
                "cls",
            )?;
            AgentCommand::StartMonitor(MonitorSpec {
                name,
                class,
                args: body.args,
            })
        }
        AgentCommandKind::StopMonitor => {
            let body: StopMonitorBody = parse_body(&req.body)?;
            let name = required(body.name.or_else(|| req.query.get("name").cloned()), "name")?;
            AgentCommand::StopMonitor(name)
        }
        AgentCommandKind::StopAllMonitors => AgentCommand::StopAllMonitors,
        AgentCommandKind::SessionStarting => AgentCommand::SessionStarting,
        AgentCommandKind::SessionFinished => AgentCommand::SessionFinished,
        AgentCommandKind::IterationStarting => {
            let body: IterationStartingBody = parse_body(&req.body)?;
            let count = match (body.iteration_count, req.query.get("iterationCount")) {
                (Some(n), _) => n,
                (None, Some(text)) => text.trim().parse().map_err(|_| {
                    AgentError::Decode(format!("iterationCount is not a number: {text}"))
                })?,
                (None, None) => 0,
            };
            let is_reproduction = match body.is_reproduction {
                Some(v) => v,
                None => query_bool(req, "isReproduction")?.unwrap_or(false),
            };
            let last_was_fault = match body.last_was_fault {
                Some(v) => v,
                None => query_bool(req, "lastWasFault")?.unwrap_or(false),
            };
            AgentCommand::IterationStarting(IterationStartingArgs {
                iteration: count,
                is_reproduction,
                last_was_fault,
            })
        }
        AgentCommandKind::IterationFinished => AgentCommand::IterationFinished,
        AgentCommandKind::DetectedFault => AgentCommand::DetectedFault,
        AgentCommandKind::GetMonitorData => AgentCommand::GetMonitorData,
        AgentCommandKind::MustStop => AgentCommand::MustStop,
        AgentCommandKind::Message => {
            AgentCommand::Message(req.query.get("msg").cloned().unwrap_or_default())
        }
    };
    Ok(command)
}

fn decode_publisher(
    kind: PublisherCommandKind,
    id: &str,
    req: &Request,
) -> Result<PublisherCommand, AgentError> {
    let body = req.body.as_slice();
    let command = match kind {
        PublisherCommandKind::CreatePublisher => {
            let parsed: CreatePublisherBody = parse_body(body)?;
            PublisherCommand::Create(PublisherSpec::from_body(id.to_string(), parsed))
        }
        PublisherCommandKind::SetIteration => {
            PublisherCommand::SetIteration(parse_body::<SetIterationBody>(body)?.iteration)
        }
        PublisherCommandKind::SetIsControlIteration => PublisherCommand::SetIsControlIteration(
            parse_body::<SetIsControlIterationBody>(body)?.is_control_iteration,
        ),
        PublisherCommandKind::SetIsControlRecordingIteration => {
            PublisherCommand::SetIsControlRecordingIteration(
                parse_body::<SetIsControlRecordingIterationBody>(body)?
                    .is_control_recording_iteration,
            )
        }
        PublisherCommandKind::SetIsIterationAfterFault => {
            PublisherCommand::SetIsIterationAfterFault(
                parse_body::<SetIsIterationAfterFaultBody>(body)?.is_iteration_after_fault,
            )
        }
        PublisherCommandKind::GetResult => PublisherCommand::GetResult,
        PublisherCommandKind::SetResult => {
            PublisherCommand::SetResult(parse_body::<SetResultBody>(body)?.value)
        }
        PublisherCommandKind::Start => PublisherCommand::Start,
        PublisherCommandKind::Stop => PublisherCommand::Stop,
        PublisherCommandKind::Open => PublisherCommand::Open,
        PublisherCommandKind::Close => PublisherCommand::Close,
        PublisherCommandKind::Accept => PublisherCommand::Accept,
        PublisherCommandKind::Call => {
            let call: CallBody = parse_body(body)?;
            PublisherCommand::Call {
                method: call.method,
                args: call.args,
            }
        }
        PublisherCommandKind::SetProperty => {
            let prop: SetPropertyBody = parse_body(body)?;
            PublisherCommand::SetProperty {
                name: prop.property,
                value: prop.data,
            }
        }
        PublisherCommandKind::GetProperty => {
            let name = match parse_body::<GetPropertyBody>(body)? {
                GetPropertyBody::Bare(name) => Some(name),
                GetPropertyBody::Named { property } => Some(property),
                GetPropertyBody::Empty {} => req.query.get("name").cloned(),
            };
            PublisherCommand::GetProperty(required(name, "property")?)
        }
        PublisherCommandKind::Output => {
            PublisherCommand::Output(parse_body::<DataBody>(body)?.data)
        }
        PublisherCommandKind::Input => PublisherCommand::Input,
        PublisherCommandKind::WantBytes => {
            PublisherCommand::WantBytes(to_count(parse_body::<CountBody>(body)?.count)?)
        }
        PublisherCommandKind::ReadBytes => {
            PublisherCommand::ReadBytes(to_count(parse_body::<CountBody>(body)?.count)?)
        }
        PublisherCommandKind::ReadAllBytes => PublisherCommand::ReadAllBytes,
    };
    Ok(command)
}
