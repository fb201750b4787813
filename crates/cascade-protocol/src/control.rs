use crate::message::Message;
use crate::{ProtoError, wire_tags};

wire_tags! {
    /// Requests the runner sends on the Control channel.
    pub enum ControlRequestTag ("control request") {
        CompositionStop = 0,
        CompositionPause = 1,
        CompositionUnpause = 2,
        InputPortValueModify = 3,
        InputPortValueRetrieve = 4,
        OutputPortValueRetrieve = 5,
        InputPortSummaryRetrieve = 6,
        OutputPortSummaryRetrieve = 7,
        TriggerPortFireEvent = 8,
        PublishedInputPortNamesRetrieve = 9,
        PublishedOutputPortNamesRetrieve = 10,
        PublishedInputPortTypesRetrieve = 11,
        PublishedOutputPortTypesRetrieve = 12,
        PublishedInputPortDetailsRetrieve = 13,
        PublishedOutputPortDetailsRetrieve = 14,
        PublishedInputPortFireEvent = 15,
        PublishedInputPortValueModify = 16,
        PublishedInputPortValueRetrieve = 17,
        PublishedOutputPortValueRetrieve = 18,
        SlowHeartbeat = 19,
        InputPortTelemetrySubscribe = 20,
        InputPortTelemetryUnsubscribe = 21,
        OutputPortTelemetrySubscribe = 22,
        OutputPortTelemetryUnsubscribe = 23,
        EventTelemetrySubscribe = 24,
        EventTelemetryUnsubscribe = 25,
        AllTelemetrySubscribe = 26,
        AllTelemetryUnsubscribe = 27,
    }
}

wire_tags! {
    /// Replies a composition sends on the Control channel.
    ///
    /// Name, type and detail retrievals carry a string list. Value
    /// retrievals carry one optional JSON string. Summary retrievals and
    /// input/output port telemetry subscriptions carry the port's current
    /// summary. Every other reply is empty.
    pub enum ControlReplyTag ("control reply") {
        CompositionStopping = 0,
        CompositionPaused = 1,
        CompositionUnpaused = 2,
        InputPortValueModified = 3,
        InputPortValueRetrieved = 4,
        OutputPortValueRetrieved = 5,
        InputPortSummaryRetrieved = 6,
        OutputPortSummaryRetrieved = 7,
        TriggerPortFiredEvent = 8,
        PublishedInputPortNamesRetrieved = 9,
        PublishedOutputPortNamesRetrieved = 10,
        PublishedInputPortTypesRetrieved = 11,
        PublishedOutputPortTypesRetrieved = 12,
        PublishedInputPortDetailsRetrieved = 13,
        PublishedOutputPortDetailsRetrieved = 14,
        PublishedInputPortFiredEvent = 15,
        PublishedInputPortValueModified = 16,
        PublishedInputPortValueRetrieved = 17,
        PublishedOutputPortValueRetrieved = 18,
        HeartbeatSlowed = 19,
        InputPortTelemetrySubscribed = 20,
        InputPortTelemetryUnsubscribed = 21,
        OutputPortTelemetrySubscribed = 22,
        OutputPortTelemetryUnsubscribed = 23,
        EventTelemetrySubscribed = 24,
        EventTelemetryUnsubscribed = 25,
        AllTelemetrySubscribed = 26,
        AllTelemetryUnsubscribed = 27,
    }
}

impl ControlRequestTag {
    /// The only reply a composition may legally send for this request.
    pub fn reply_tag(self) -> ControlReplyTag {
        use ControlReplyTag as R;
        use ControlRequestTag as Q;
        match self {
            Q::CompositionStop => R::CompositionStopping,
            Q::CompositionPause => R::CompositionPaused,
            Q::CompositionUnpause => R::CompositionUnpaused,
            Q::InputPortValueModify => R::InputPortValueModified,
            Q::InputPortValueRetrieve => R::InputPortValueRetrieved,
            Q::OutputPortValueRetrieve => R::OutputPortValueRetrieved,
            Q::InputPortSummaryRetrieve => R::InputPortSummaryRetrieved,
            Q::OutputPortSummaryRetrieve => R::OutputPortSummaryRetrieved,
            Q::TriggerPortFireEvent => R::TriggerPortFiredEvent,
            Q::PublishedInputPortNamesRetrieve => R::PublishedInputPortNamesRetrieved,
            Q::PublishedOutputPortNamesRetrieve => R::PublishedOutputPortNamesRetrieved,
            Q::PublishedInputPortTypesRetrieve => R::PublishedInputPortTypesRetrieved,
            Q::PublishedOutputPortTypesRetrieve => R::PublishedOutputPortTypesRetrieved,
            Q::PublishedInputPortDetailsRetrieve => R::PublishedInputPortDetailsRetrieved,
            Q::PublishedOutputPortDetailsRetrieve => R::PublishedOutputPortDetailsRetrieved,
            Q::PublishedInputPortFireEvent => R::PublishedInputPortFiredEvent,
            Q::PublishedInputPortValueModify => R::PublishedInputPortValueModified,
            Q::PublishedInputPortValueRetrieve => R::PublishedInputPortValueRetrieved,
            Q::PublishedOutputPortValueRetrieve => R::PublishedOutputPortValueRetrieved,
            Q::SlowHeartbeat => R::HeartbeatSlowed,
            Q::InputPortTelemetrySubscribe => R::InputPortTelemetrySubscribed,
            Q::InputPortTelemetryUnsubscribe => R::InputPortTelemetryUnsubscribed,
            Q::OutputPortTelemetrySubscribe => R::OutputPortTelemetrySubscribed,
            Q::OutputPortTelemetryUnsubscribe => R::OutputPortTelemetryUnsubscribed,
            Q::EventTelemetrySubscribe => R::EventTelemetrySubscribed,
            Q::EventTelemetryUnsubscribe => R::EventTelemetryUnsubscribed,
            Q::AllTelemetrySubscribe => R::AllTelemetrySubscribed,
            Q::AllTelemetryUnsubscribe => R::AllTelemetryUnsubscribed,
        }
    }
}

/// A typed Control request.
///
/// Port values travel as JSON text; summaries are display strings produced
/// by the composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// `timeout_secs` is how long the composition may take to shut down;
    /// negative means no limit.
    Stop {
        timeout_secs: i64,
    },
    Pause,
    Unpause,
    SetInputPortValue {
        port: String,
        value: String,
    },
    InputPortValue {
        port: String,
    },
    OutputPortValue {
        port: String,
    },
    InputPortSummary {
        port: String,
    },
    OutputPortSummary {
        port: String,
    },
    FireTriggerPortEvent {
        port: String,
    },
    PublishedInputPortNames,
    PublishedOutputPortNames,
    PublishedInputPortTypes,
    PublishedOutputPortTypes,
    PublishedInputPortDetails,
    PublishedOutputPortDetails,
    FirePublishedInputPortEvent {
        ports: Vec<String>,
    },
    SetPublishedInputPortValues {
        values: Vec<(String, String)>,
    },
    PublishedInputPortValue {
        port: String,
    },
    PublishedOutputPortValue {
        port: String,
    },
    SlowHeartbeat,
    SubscribeInputPortTelemetry {
        composition: String,
        port: String,
    },
    UnsubscribeInputPortTelemetry {
        composition: String,
        port: String,
    },
    SubscribeOutputPortTelemetry {
        composition: String,
        port: String,
    },
    UnsubscribeOutputPortTelemetry {
        composition: String,
        port: String,
    },
    SubscribeEventTelemetry {
        composition: String,
    },
    UnsubscribeEventTelemetry {
        composition: String,
    },
    SubscribeAllTelemetry {
        composition: String,
    },
    UnsubscribeAllTelemetry {
        composition: String,
    },
}

impl ControlRequest {
    pub fn tag(&self) -> ControlRequestTag {
        use ControlRequestTag as T;
        match self {
            Self::Stop { .. } => T::CompositionStop,
            Self::Pause => T::CompositionPause,
            Self::Unpause => T::CompositionUnpause,
            Self::SetInputPortValue { .. } => T::InputPortValueModify,
            Self::InputPortValue { .. } => T::InputPortValueRetrieve,
            Self::OutputPortValue { .. } => T::OutputPortValueRetrieve,
            Self::InputPortSummary { .. } => T::InputPortSummaryRetrieve,
            Self::OutputPortSummary { .. } => T::OutputPortSummaryRetrieve,
            Self::FireTriggerPortEvent { .. } => T::TriggerPortFireEvent,
            Self::PublishedInputPortNames => T::PublishedInputPortNamesRetrieve,
            Self::PublishedOutputPortNames => T::PublishedOutputPortNamesRetrieve,
            Self::PublishedInputPortTypes => T::PublishedInputPortTypesRetrieve,
            Self::PublishedOutputPortTypes => T::PublishedOutputPortTypesRetrieve,
            Self::PublishedInputPortDetails => T::PublishedInputPortDetailsRetrieve,
            Self::PublishedOutputPortDetails => T::PublishedOutputPortDetailsRetrieve,
            Self::FirePublishedInputPortEvent { .. } => T::PublishedInputPortFireEvent,
            Self::SetPublishedInputPortValues { .. } => T::PublishedInputPortValueModify,
            Self::PublishedInputPortValue { .. } => T::PublishedInputPortValueRetrieve,
            Self::PublishedOutputPortValue { .. } => T::PublishedOutputPortValueRetrieve,
            Self::SlowHeartbeat => T::SlowHeartbeat,
            Self::SubscribeInputPortTelemetry { .. } => T::InputPortTelemetrySubscribe,
            Self::UnsubscribeInputPortTelemetry { .. } => T::InputPortTelemetryUnsubscribe,
            Self::SubscribeOutputPortTelemetry { .. } => T::OutputPortTelemetrySubscribe,
            Self::UnsubscribeOutputPortTelemetry { .. } => T::OutputPortTelemetryUnsubscribe,
            Self::SubscribeEventTelemetry { .. } => T::EventTelemetrySubscribe,
            Self::UnsubscribeEventTelemetry { .. } => T::EventTelemetryUnsubscribe,
            Self::SubscribeAllTelemetry { .. } => T::AllTelemetrySubscribe,
            Self::UnsubscribeAllTelemetry { .. } => T::AllTelemetryUnsubscribe,
        }
    }

    pub fn reply_tag(&self) -> ControlReplyTag {
        self.tag().reply_tag()
    }

    pub fn to_message(&self) -> Message {
        let mut message = Message::new(self.tag());
        match self {
            Self::Stop { timeout_secs } => message.push(*timeout_secs),
            Self::SetInputPortValue { port, value } => {
                message.push(port.as_str());
                message.push(value.as_str());
            },
            Self::InputPortValue { port }
            | Self::OutputPortValue { port }
            | Self::InputPortSummary { port }
            | Self::OutputPortSummary { port }
            | Self::FireTriggerPortEvent { port }
            | Self::PublishedInputPortValue { port }
            | Self::PublishedOutputPortValue { port } => message.push(port.as_str()),
            Self::FirePublishedInputPortEvent { ports } => message.push_list(ports.iter().cloned()),
            Self::SetPublishedInputPortValues { values } => {
                message.push(values.len() as u64);
                for (port, value) in values {
                    message.push(port.as_str());
                    message.push(value.as_str());
                }
            },
            Self::SubscribeInputPortTelemetry { composition, port }
            | Self::UnsubscribeInputPortTelemetry { composition, port }
            | Self::SubscribeOutputPortTelemetry { composition, port }
            | Self::UnsubscribeOutputPortTelemetry { composition, port } => {
                message.push(composition.as_str());
                message.push(port.as_str());
            },
            Self::SubscribeEventTelemetry { composition }
            | Self::UnsubscribeEventTelemetry { composition }
            | Self::SubscribeAllTelemetry { composition }
            | Self::UnsubscribeAllTelemetry { composition } => message.push(composition.as_str()),
            Self::Pause
            | Self::Unpause
            | Self::PublishedInputPortNames
            | Self::PublishedOutputPortNames
            | Self::PublishedInputPortTypes
            | Self::PublishedOutputPortTypes
            | Self::PublishedInputPortDetails
            | Self::PublishedOutputPortDetails
            | Self::SlowHeartbeat => {},
        }
        message
    }

    /// Decodes a request on the composition side of the channel.
    pub fn from_message(message: &Message) -> Result<Self, ProtoError> {
        use ControlRequestTag as T;
        let tag = ControlRequestTag::try_from(message.tag)?;
        let mut r = message.reader();
        let request = match tag {
            T::CompositionStop => Self::Stop {
                timeout_secs: r.int()?,
            },
            T::CompositionPause => Self::Pause,
            T::CompositionUnpause => Self::Unpause,
            T::InputPortValueModify => Self::SetInputPortValue {
                port: r.string()?.to_string(),
                value: r.string()?.to_string(),
            },
            T::InputPortValueRetrieve => Self::InputPortValue {
                port: r.string()?.to_string(),
            },
            T::OutputPortValueRetrieve => Self::OutputPortValue {
                port: r.string()?.to_string(),
            },
            T::InputPortSummaryRetrieve => Self::InputPortSummary {
                port: r.string()?.to_string(),
            },
            T::OutputPortSummaryRetrieve => Self::OutputPortSummary {
                port: r.string()?.to_string(),
            },
            T::TriggerPortFireEvent => Self::FireTriggerPortEvent {
                port: r.string()?.to_string(),
            },
            T::PublishedInputPortNamesRetrieve => Self::PublishedInputPortNames,
            T::PublishedOutputPortNamesRetrieve => Self::PublishedOutputPortNames,
            T::PublishedInputPortTypesRetrieve => Self::PublishedInputPortTypes,
            T::PublishedOutputPortTypesRetrieve => Self::PublishedOutputPortTypes,
            T::PublishedInputPortDetailsRetrieve => Self::PublishedInputPortDetails,
            T::PublishedOutputPortDetailsRetrieve => Self::PublishedOutputPortDetails,
            T::PublishedInputPortFireEvent => Self::FirePublishedInputPortEvent {
                ports: r.string_list()?,
            },
            T::PublishedInputPortValueModify => {
                let count = r.uint()? as usize;
                if count.saturating_mul(2) > r.remaining() {
                    return Err(ProtoError::malformed(
                        message.tag,
                        format!("{count} port values declared, {} frames left", r.remaining()),
                    ));
                }
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    let port = r.string()?.to_string();
                    let value = r.string()?.to_string();
                    values.push((port, value));
                }
                Self::SetPublishedInputPortValues { values }
            },
            T::PublishedInputPortValueRetrieve => Self::PublishedInputPortValue {
                port: r.string()?.to_string(),
            },
            T::PublishedOutputPortValueRetrieve => Self::PublishedOutputPortValue {
                port: r.string()?.to_string(),
            },
            T::SlowHeartbeat => Self::SlowHeartbeat,
            T::InputPortTelemetrySubscribe => Self::SubscribeInputPortTelemetry {
                composition: r.string()?.to_string(),
                port: r.string()?.to_string(),
            },
            T::InputPortTelemetryUnsubscribe => Self::UnsubscribeInputPortTelemetry {
                composition: r.string()?.to_string(),
                port: r.string()?.to_string(),
            },
            T::OutputPortTelemetrySubscribe => Self::SubscribeOutputPortTelemetry {
                composition: r.string()?.to_string(),
                port: r.string()?.to_string(),
            },
            T::OutputPortTelemetryUnsubscribe => Self::UnsubscribeOutputPortTelemetry {
                composition: r.string()?.to_string(),
                port: r.string()?.to_string(),
            },
            T::EventTelemetrySubscribe => Self::SubscribeEventTelemetry {
                composition: r.string()?.to_string(),
            },
            T::EventTelemetryUnsubscribe => Self::UnsubscribeEventTelemetry {
                composition: r.string()?.to_string(),
            },
            T::AllTelemetrySubscribe => Self::SubscribeAllTelemetry {
                composition: r.string()?.to_string(),
            },
            T::AllTelemetryUnsubscribe => Self::UnsubscribeAllTelemetry {
                composition: r.string()?.to_string(),
            },
        };
        r.finish()?;
        Ok(request)
    }
}
