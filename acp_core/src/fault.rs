use crate::codec::base64_bytes;
use serde::{Deserialize, Serialize};

/// Exploitability used when a fault does not carry its own rating.
const DEFAULT_RISK: &str = "UNKNOWN";

/// Kind of record returned by `GetMonitorData`. Encoded on the wire as an
/// integer (0 = unknown, 1 = fault, 2 = data).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(into = "u8", try_from = "u8")]
pub enum FaultType {
    #[default]
    Unknown,
    Fault,
    Data,
}

impl From<FaultType> for u8 {
    fn from(value: FaultType) -> Self {
        match value {
            FaultType::Unknown => 0,
            FaultType::Fault => 1,
            FaultType::Data => 2,
        }
    }
}

impl TryFrom<u8> for FaultType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FaultType::Unknown),
            1 => Ok(FaultType::Fault),
            2 => Ok(FaultType::Data),
            other => Err(format!("unknown fault type {other}")),
        }
    }
}

/// A named binary artifact attached to a fault record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CollectedData {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value", with = "base64_bytes")]
    pub value: Vec<u8>,
}

/// The structured result of fault detection for one iteration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FaultRecord {
    pub iteration: u32,
    pub control_iteration: bool,
    pub control_recording_iteration: bool,
    #[serde(rename = "type")]
    pub fault_type: FaultType,
    pub detection_source: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub major_hash: Option<String>,
    pub minor_hash: Option<String>,
    pub exploitability: Option<String>,
    pub folder_name: Option<String>,
    #[serde(default)]
    pub collected_data: Vec<CollectedData>,
}

/// Details a monitor attaches when its data describes a fault.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultInfo {
    pub description: String,
    pub major_hash: Option<String>,
    pub minor_hash: Option<String>,
    pub risk: Option<String>,
    /// The monitor wants the engine to stop fuzzing after this fault.
    pub must_stop: bool,
}

/// What a monitor hands back from `get_monitor_data`. The agent turns it into
/// a [`FaultRecord`] by adding the iteration context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorData {
    pub title: Option<String>,
    /// Defaults to the monitor's class when `None`.
    pub detection_source: Option<String>,
    /// `Some` when this data describes a fault rather than plain artifacts.
    pub fault: Option<FaultInfo>,
    pub data: Vec<(String, Vec<u8>)>,
}

/// Iteration state stamped onto every record collected for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordContext {
    pub iteration: u32,
    pub control_iteration: bool,
    pub control_recording_iteration: bool,
}

/// First eight upper-case hex digits of the MD5 of `text`.
fn bucket_hash(text: &str) -> String {
    let digest = md5::compute(text.as_bytes());
    format!("{:x}", digest)[..8].to_uppercase()
}

impl FaultRecord {
    pub fn from_monitor_data(data: MonitorData, ctx: RecordContext, monitor_class: &str) -> Self {
        let detection_source = data
            .detection_source
            .unwrap_or_else(|| monitor_class.to_string());
        let collected_data = data
            .data
            .into_iter()
            .map(|(key, value)| CollectedData { key, value })
            .collect();

        let mut record = FaultRecord {
            iteration: ctx.iteration,
            control_iteration: ctx.control_iteration,
            control_recording_iteration: ctx.control_recording_iteration,
            fault_type: FaultType::Data,
            detection_source: Some(detection_source),
            title: data.title,
            collected_data,
            ..Default::default()
        };

        if let Some(fault) = data.fault {
            let title = record.title.clone().unwrap_or_default();
            let major = fault
                .major_hash
                .unwrap_or_else(|| bucket_hash(&title));
            let minor = fault
                .minor_hash
                .unwrap_or_else(|| bucket_hash(&fault.description));
            let risk = fault.risk.unwrap_or_else(|| DEFAULT_RISK.to_string());

            record.fault_type = FaultType::Fault;
            record.folder_name = Some(format!("{risk}_{major}_{minor}"));
            record.description = Some(fault.description);
            record.major_hash = Some(major);
            record.minor_hash = Some(minor);
            record.exploitability = Some(risk);
        }

        record
    }
}
