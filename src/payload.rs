//! Strongly typed payloads, one per [`JobKind`].

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{entity::JobKind, error::JobError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateAction {
    Start,
    Stop,
    Restart,
    Freeze,
    Unfreeze,
}

impl std::fmt::Display for StateAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Freeze => "freeze",
            Self::Unfreeze => "unfreeze",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangePayload {
    pub action: StateAction,
    #[serde(default)]
    pub force: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Resource limits in the provider's notation, e.g. `"512MB"` and `"2"`.
pub struct Limits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
}

impl Limits {
    fn validate(&self) -> Result<(), JobError> {
        if let Some(memory) = &self.memory {
            let digits = memory
                .strip_suffix("MB")
                .or_else(|| memory.strip_suffix("GB"))
                .ok_or_else(|| {
                    JobError::InvalidPayload(format!("memory '{memory}' must end in MB or GB"))
                })?;
            match digits.parse::<u64>() {
                Ok(n) if n > 0 => {}
                _ => {
                    return Err(JobError::InvalidPayload(format!(
                        "memory '{memory}' must be a positive size"
                    )));
                }
            }
        }
        if let Some(cpu) = &self.cpu {
            match cpu.parse::<u32>() {
                Ok(n) if n > 0 => {}
                _ => {
                    return Err(JobError::InvalidPayload(format!(
                        "cpu '{cpu}' must be a positive integer"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceType {
    #[default]
    Container,
    VirtualMachine,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInstancePayload {
    pub name: String,
    pub image: String,
    #[serde(rename = "type", default)]
    pub instance_type: InstanceType,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    #[serde(default = "default_attach_network")]
    pub attach_network: bool,
}

fn default_attach_network() -> bool {
    true
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteInstancePayload {
    #[serde(default)]
    pub force: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub snapshot_name: String,
    #[serde(default)]
    pub stateful: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMappingPayload {
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Closed set of job payloads. The variant determines the [`JobKind`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobPayload {
    StateChange(StateChangePayload),
    UpdateLimits(Limits),
    CreateInstance(CreateInstancePayload),
    DeleteInstance(DeleteInstancePayload),
    CreateSnapshot(SnapshotPayload),
    RestoreSnapshot(SnapshotPayload),
    DeleteSnapshot(SnapshotPayload),
    AddPort(PortMappingPayload),
    RemovePort(PortMappingPayload),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::StateChange(_) => JobKind::StateChange,
            Self::UpdateLimits(_) => JobKind::UpdateLimits,
            Self::CreateInstance(_) => JobKind::CreateInstance,
            Self::DeleteInstance(_) => JobKind::DeleteInstance,
            Self::CreateSnapshot(_) => JobKind::CreateSnapshot,
            Self::RestoreSnapshot(_) => JobKind::RestoreSnapshot,
            Self::DeleteSnapshot(_) => JobKind::DeleteSnapshot,
            Self::AddPort(_) => JobKind::AddPort,
            Self::RemovePort(_) => JobKind::RemovePort,
        }
    }

    /// Admission-time checks that do not need the provider.
    pub fn validate(&self) -> Result<(), JobError> {
        match self {
            Self::UpdateLimits(limits) => {
                if limits.memory.is_none() && limits.cpu.is_none() {
                    return Err(JobError::InvalidPayload(
                        "at least one of memory or cpu is required".to_string(),
                    ));
                }
                limits.validate()
            }
            Self::CreateInstance(payload) => {
                if payload.name.is_empty() || payload.image.is_empty() {
                    return Err(JobError::InvalidPayload(
                        "name and image are required".to_string(),
                    ));
                }
                payload.limits.validate()
            }
            Self::CreateSnapshot(s) | Self::RestoreSnapshot(s) | Self::DeleteSnapshot(s)
                if s.snapshot_name.is_empty() =>
            {
                Err(JobError::InvalidPayload(
                    "snapshot_name is required".to_string(),
                ))
            }
            Self::AddPort(p) | Self::RemovePort(p) if p.host_port == 0 || p.container_port == 0 => {
                Err(JobError::InvalidPayload("ports must be non-zero".to_string()))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn into_parts(self) -> Result<(JobKind, serde_json::Value), JobError> {
        let kind = self.kind();
        let value = match self {
            Self::StateChange(p) => serde_json::to_value(p),
            Self::UpdateLimits(p) => serde_json::to_value(p),
            Self::CreateInstance(p) => serde_json::to_value(p),
            Self::DeleteInstance(p) => serde_json::to_value(p),
            Self::CreateSnapshot(p) | Self::RestoreSnapshot(p) | Self::DeleteSnapshot(p) => {
                serde_json::to_value(p)
            }
            Self::AddPort(p) | Self::RemovePort(p) => serde_json::to_value(p),
        }
        .map_err(JobError::CouldNotSerializePayload)?;
        Ok((kind, value))
    }

    pub(crate) fn from_parts(kind: JobKind, value: serde_json::Value) -> Result<Self, JobError> {
        fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, JobError> {
            serde_json::from_value(value).map_err(JobError::CouldNotDeserializePayload)
        }
        Ok(match kind {
            JobKind::StateChange => Self::StateChange(decode(value)?),
            JobKind::UpdateLimits => Self::UpdateLimits(decode(value)?),
            JobKind::CreateInstance => Self::CreateInstance(decode(value)?),
            JobKind::DeleteInstance => Self::DeleteInstance(decode(value)?),
            JobKind::CreateSnapshot => Self::CreateSnapshot(decode(value)?),
            JobKind::RestoreSnapshot => Self::RestoreSnapshot(decode(value)?),
            JobKind::DeleteSnapshot => Self::DeleteSnapshot(decode(value)?),
            JobKind::AddPort => Self::AddPort(decode(value)?),
            JobKind::RemovePort => Self::RemovePort(decode(value)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_payloads_keep_their_wire_shape() {
        let (kind, value) = JobPayload::AddPort(PortMappingPayload {
            host_port: 8080,
            container_port: 80,
            protocol: Protocol::Tcp,
        })
        .into_parts()
        .unwrap();
        assert_eq!(kind, JobKind::AddPort);
        assert_eq!(
            value,
            serde_json::json!({"host_port": 8080, "container_port": 80, "protocol": "tcp"})
        );

        let payload = JobPayload::from_parts(
            JobKind::StateChange,
            serde_json::json!({"action": "stop"}),
        )
        .unwrap();
        assert_eq!(
            payload,
            JobPayload::StateChange(StateChangePayload {
                action: StateAction::Stop,
                force: false
            })
        );
    }

    #[test]
    fn create_instance_defaults_to_network_attached() {
        let payload = JobPayload::from_parts(
            JobKind::CreateInstance,
            serde_json::json!({"name": "web-01", "image": "alpine/3.20", "type": "virtual-machine"}),
        )
        .unwrap();
        let JobPayload::CreateInstance(create) = payload else {
            panic!("wrong variant");
        };
        assert!(create.attach_network);
        assert_eq!(create.instance_type, InstanceType::VirtualMachine);
    }

    #[test]
    fn limits_are_validated_at_admission() {
        let ok = JobPayload::UpdateLimits(Limits {
            memory: Some("512MB".into()),
            cpu: Some("2".into()),
        });
        assert!(ok.validate().is_ok());

        let bad_memory = JobPayload::UpdateLimits(Limits {
            memory: Some("512".into()),
            cpu: None,
        });
        assert!(matches!(
            bad_memory.validate(),
            Err(JobError::InvalidPayload(_))
        ));

        let empty = JobPayload::UpdateLimits(Limits::default());
        assert!(empty.validate().is_err());
    }

    #[test]
    fn mismatched_payload_is_rejected() {
        let result =
            JobPayload::from_parts(JobKind::AddPort, serde_json::json!({"action": "start"}));
        assert!(matches!(
            result,
            Err(JobError::CouldNotDeserializePayload(_))
        ));
    }
}
