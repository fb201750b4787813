use crate::message::{FrameReader, Message};
use crate::{ProtoError, wire_tags};

wire_tags! {
    /// Messages a composition publishes on the Telemetry channel.
    pub enum TelemetryTag ("telemetry") {
        Heartbeat = 0,
        NodeExecutionStarted = 1,
        NodeExecutionFinished = 2,
        InputPortsUpdated = 3,
        OutputPortsUpdated = 4,
        PublishedOutputPortsUpdated = 5,
        EventFinished = 6,
        EventDropped = 7,
        Error = 8,
        StopRequested = 9,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortUpdate {
    pub composition: String,
    pub port: String,
    /// Received (input ports) or sent (output ports) an event.
    pub event: bool,
    /// Received or sent data along with the event.
    pub data: bool,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPortUpdate {
    pub port: String,
    pub sent_data: bool,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Telemetry {
    Heartbeat,
    NodeExecutionStarted { composition: String, node: String },
    NodeExecutionFinished { composition: String, node: String },
    InputPortsUpdated(Vec<PortUpdate>),
    OutputPortsUpdated(Vec<PortUpdate>),
    PublishedOutputPortsUpdated(Vec<PublishedPortUpdate>),
    EventFinished,
    EventDropped { composition: String, port: String },
    Error { message: String },
    StopRequested,
}

impl Telemetry {
    pub fn tag(&self) -> TelemetryTag {
        match self {
            Self::Heartbeat => TelemetryTag::Heartbeat,
            Self::NodeExecutionStarted { .. } => TelemetryTag::NodeExecutionStarted,
            Self::NodeExecutionFinished { .. } => TelemetryTag::NodeExecutionFinished,
            Self::InputPortsUpdated(_) => TelemetryTag::InputPortsUpdated,
            Self::OutputPortsUpdated(_) => TelemetryTag::OutputPortsUpdated,
            Self::PublishedOutputPortsUpdated(_) => TelemetryTag::PublishedOutputPortsUpdated,
            Self::EventFinished => TelemetryTag::EventFinished,
            Self::EventDropped { .. } => TelemetryTag::EventDropped,
            Self::Error { .. } => TelemetryTag::Error,
            Self::StopRequested => TelemetryTag::StopRequested,
        }
    }

    pub fn to_message(&self) -> Message {
        let mut message = Message::new(self.tag());
        match self {
            Self::NodeExecutionStarted { composition, node }
            | Self::NodeExecutionFinished { composition, node } => {
                message.push(composition.as_str());
                message.push(node.as_str());
            },
            Self::InputPortsUpdated(updates) | Self::OutputPortsUpdated(updates) => {
                for update in updates {
                    message.push(update.composition.as_str());
                    message.push(update.port.as_str());
                    message.push(update.event);
                    message.push(update.data);
                    message.push(update.summary.as_str());
                }
            },
            Self::PublishedOutputPortsUpdated(updates) => {
                for update in updates {
                    message.push(update.port.as_str());
                    message.push(update.sent_data);
                    message.push(update.summary.as_str());
                }
            },
            Self::EventDropped { composition, port } => {
                message.push(composition.as_str());
                message.push(port.as_str());
            },
            Self::Error { message: text } => message.push(text.as_str()),
            Self::Heartbeat | Self::EventFinished | Self::StopRequested => {},
        }
        message
    }

    /// Decodes a whole telemetry message. Port-update messages carry a
    /// variable number of fixed-size groups; a partial group is malformed.
    pub fn from_message(message: &Message) -> Result<Self, ProtoError> {
        let tag = TelemetryTag::try_from(message.tag)?;
        let mut r = message.reader();
        let telemetry = match tag {
            TelemetryTag::Heartbeat => Self::Heartbeat,
            TelemetryTag::NodeExecutionStarted => Self::NodeExecutionStarted {
                composition: r.string()?.to_string(),
                node: r.string()?.to_string(),
            },
            TelemetryTag::NodeExecutionFinished => Self::NodeExecutionFinished {
                composition: r.string()?.to_string(),
                node: r.string()?.to_string(),
            },
            TelemetryTag::InputPortsUpdated => Self::InputPortsUpdated(read_port_updates(&mut r)?),
            TelemetryTag::OutputPortsUpdated => Self::OutputPortsUpdated(read_port_updates(&mut r)?),
            TelemetryTag::PublishedOutputPortsUpdated => {
                let mut updates = Vec::new();
                while r.has_more() {
                    updates.push(PublishedPortUpdate {
                        port: r.string()?.to_string(),
                        sent_data: r.boolean()?,
                        summary: r.optional_string()?.unwrap_or_default().to_string(),
                    });
                }
                Self::PublishedOutputPortsUpdated(updates)
            },
            TelemetryTag::EventFinished => Self::EventFinished,
            TelemetryTag::EventDropped => Self::EventDropped {
                composition: r.string()?.to_string(),
                port: r.string()?.to_string(),
            },
            TelemetryTag::Error => Self::Error {
                message: r.string()?.to_string(),
            },
            TelemetryTag::StopRequested => Self::StopRequested,
        };
        r.finish()?;
        Ok(telemetry)
    }
}

fn read_port_updates(r: &mut FrameReader<'_>) -> Result<Vec<PortUpdate>, ProtoError> {
    let mut updates = Vec::new();
    while r.has_more() {
        updates.push(PortUpdate {
            composition: r.string()?.to_string(),
            port: r.string()?.to_string(),
            event: r.boolean()?,
            data: r.boolean()?,
            summary: r.optional_string()?.unwrap_or_default().to_string(),
        });
    }
    Ok(updates)
}
