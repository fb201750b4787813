//! Port I/O, telemetry subscriptions and published ports.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use cascade_protocol::{ControlRequest, FrameReader, Message, ProtoError};
use serde_json::Value;

use super::{ControlState, DRAIN_SLICE, Inner, Runner};
use crate::error::{Error, Result};
use crate::port::PublishedPort;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Input,
    Output,
}

impl Direction {
    fn discovery_requests(self) -> [ControlRequest; 3] {
        match self {
            Self::Input => [
                ControlRequest::PublishedInputPortNames,
                ControlRequest::PublishedInputPortTypes,
                ControlRequest::PublishedInputPortDetails,
            ],
            Self::Output => [
                ControlRequest::PublishedOutputPortNames,
                ControlRequest::PublishedOutputPortTypes,
                ControlRequest::PublishedOutputPortDetails,
            ],
        }
    }
}

impl Runner {
    pub fn set_input_port_value(&self, port: &str, value: &Value) -> Result<()> {
        let request = ControlRequest::SetInputPortValue {
            port: port.to_string(),
            value: value.to_string(),
        };
        self.inner.request("set input port value", &request, None)?;
        Ok(())
    }

    pub fn fire_trigger_port_event(&self, port: &str) -> Result<()> {
        let request = ControlRequest::FireTriggerPortEvent {
            port: port.to_string(),
        };
        self.inner.request("fire trigger port event", &request, None)?;
        Ok(())
    }

    pub fn input_port_value(&self, port: &str) -> Result<Option<Value>> {
        self.inner.value(
            "input port value",
            &ControlRequest::InputPortValue {
                port: port.to_string(),
            },
        )
    }

    pub fn output_port_value(&self, port: &str) -> Result<Option<Value>> {
        self.inner.value(
            "output port value",
            &ControlRequest::OutputPortValue {
                port: port.to_string(),
            },
        )
    }

    pub fn input_port_summary(&self, port: &str) -> Result<Option<String>> {
        self.inner.summary(
            "input port summary",
            &ControlRequest::InputPortSummary {
                port: port.to_string(),
            },
        )
    }

    pub fn output_port_summary(&self, port: &str) -> Result<Option<String>> {
        self.inner.summary(
            "output port summary",
            &ControlRequest::OutputPortSummary {
                port: port.to_string(),
            },
        )
    }

    /// Starts port-update telemetry for one input port. Returns the port's
    /// current summary. An empty `composition` names the top level.
    pub fn subscribe_to_input_port_telemetry(
        &self,
        composition: &str,
        port: &str,
    ) -> Result<Option<String>> {
        self.inner.summary(
            "subscribe to input port telemetry",
            &ControlRequest::SubscribeInputPortTelemetry {
                composition: composition.to_string(),
                port: port.to_string(),
            },
        )
    }

    pub fn unsubscribe_from_input_port_telemetry(&self, composition: &str, port: &str) -> Result<()> {
        self.inner.command(
            "unsubscribe from input port telemetry",
            &ControlRequest::UnsubscribeInputPortTelemetry {
                composition: composition.to_string(),
                port: port.to_string(),
            },
        )
    }

    pub fn subscribe_to_output_port_telemetry(
        &self,
        composition: &str,
        port: &str,
    ) -> Result<Option<String>> {
        self.inner.summary(
            "subscribe to output port telemetry",
            &ControlRequest::SubscribeOutputPortTelemetry {
                composition: composition.to_string(),
                port: port.to_string(),
            },
        )
    }

    pub fn unsubscribe_from_output_port_telemetry(
        &self,
        composition: &str,
        port: &str,
    ) -> Result<()> {
        self.inner.command(
            "unsubscribe from output port telemetry",
            &ControlRequest::UnsubscribeOutputPortTelemetry {
                composition: composition.to_string(),
                port: port.to_string(),
            },
        )
    }

    /// Node execution and event telemetry for `composition`.
    pub fn subscribe_to_event_telemetry(&self, composition: &str) -> Result<()> {
        self.inner.command(
            "subscribe to event telemetry",
            &ControlRequest::SubscribeEventTelemetry {
                composition: composition.to_string(),
            },
        )
    }

    pub fn unsubscribe_from_event_telemetry(&self, composition: &str) -> Result<()> {
        self.inner.command(
            "unsubscribe from event telemetry",
            &ControlRequest::UnsubscribeEventTelemetry {
                composition: composition.to_string(),
            },
        )
    }

    pub fn subscribe_to_all_telemetry(&self, composition: &str) -> Result<()> {
        self.inner.command(
            "subscribe to all telemetry",
            &ControlRequest::SubscribeAllTelemetry {
                composition: composition.to_string(),
            },
        )
    }

    pub fn unsubscribe_from_all_telemetry(&self, composition: &str) -> Result<()> {
        self.inner.command(
            "unsubscribe from all telemetry",
            &ControlRequest::UnsubscribeAllTelemetry {
                composition: composition.to_string(),
            },
        )
    }

    /// Published inputs, discovered on first use and cached while the
    /// composition stays connected. Empty once the session stopped.
    pub fn published_input_ports(&self) -> Result<Vec<Arc<PublishedPort>>> {
        self.inner.published_ports(Direction::Input)
    }

    pub fn published_output_ports(&self) -> Result<Vec<Arc<PublishedPort>>> {
        self.inner.published_ports(Direction::Output)
    }

    pub fn published_input_port(&self, name: &str) -> Result<Option<Arc<PublishedPort>>> {
        Ok(find_port(self.published_input_ports()?, name))
    }

    pub fn published_output_port(&self, name: &str) -> Result<Option<Arc<PublishedPort>>> {
        Ok(find_port(self.published_output_ports()?, name))
    }

    pub fn set_published_input_port_value(&self, port: &str, value: &Value) -> Result<()> {
        self.set_published_input_port_values([(port, value.clone())])
    }

    /// Sets several published inputs with one request. Nothing propagates
    /// until an event is fired.
    pub fn set_published_input_port_values<I, K>(&self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let values = values
            .into_iter()
            .map(|(port, value)| (port.into(), value.to_string()))
            .collect::<Vec<_>>();
        if values.is_empty() {
            return Ok(());
        }
        self.inner.command(
            "set published input port values",
            &ControlRequest::SetPublishedInputPortValues { values },
        )
    }

    pub fn fire_published_input_port_event(&self, port: &str) -> Result<()> {
        self.fire_published_input_port_events([port])
    }

    /// Fires one event through all `ports` at once. Pair each call with
    /// [`Runner::wait_for_fired_published_input_port_event`] before firing
    /// again.
    pub fn fire_published_input_port_events<I, S>(&self, ports: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ports = ports.into_iter().map(Into::into).collect::<Vec<_>>();
        if ports.is_empty() {
            return Err(Error::invalid_input("fire needs at least one published input port"));
        }
        self.inner.fired_event.arm();
        self.inner.command(
            "fire published input port event",
            &ControlRequest::FirePublishedInputPortEvent { ports },
        )
    }

    /// Fires one event through every published input port. A composition
    /// without published inputs fires nothing.
    pub fn fire_all_published_input_port_events(&self) -> Result<()> {
        let ports = self.published_input_ports()?;
        if ports.is_empty() {
            return Ok(());
        }
        self.fire_published_input_port_events(ports.iter().map(|port| port.name().to_string()))
    }

    /// Blocks until the event from the most recent fire finished
    /// propagating, or the session ended.
    pub fn wait_for_fired_published_input_port_event(&self) {
        let inner = &self.inner;
        if !inner.is_active() {
            return;
        }
        match inner.draining_loop() {
            Some(event_loop) => {
                while !inner.fired_event.wait_timeout(DRAIN_SLICE) {
                    event_loop.drain(DRAIN_SLICE);
                }
            },
            None => inner.fired_event.wait(),
        }
    }

    /// Like [`Runner::wait_for_fired_published_input_port_event`]; returns
    /// `false` if `timeout` elapsed first.
    pub fn wait_for_fired_published_input_port_event_timeout(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        if !inner.is_active() {
            return true;
        }
        let Some(event_loop) = inner.draining_loop() else {
            return inner.fired_event.wait_timeout(timeout);
        };
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if inner.fired_event.wait_timeout(left.min(DRAIN_SLICE)) {
                return true;
            }
            if left <= DRAIN_SLICE {
                return false;
            }
            event_loop.drain(DRAIN_SLICE);
        }
    }

    pub fn published_input_port_value(&self, port: &str) -> Result<Option<Value>> {
        self.inner.value(
            "published input port value",
            &ControlRequest::PublishedInputPortValue {
                port: port.to_string(),
            },
        )
    }

    pub fn published_output_port_value(&self, port: &str) -> Result<Option<Value>> {
        self.inner.value(
            "published output port value",
            &ControlRequest::PublishedOutputPortValue {
                port: port.to_string(),
            },
        )
    }
}

fn find_port(ports: Vec<Arc<PublishedPort>>, name: &str) -> Option<Arc<PublishedPort>> {
    ports.into_iter().find(|port| port.name() == name)
}

impl Inner {
    /// An exchange whose reply carries nothing.
    fn command(&self, operation: &'static str, request: &ControlRequest) -> Result<()> {
        if let Some(reply) = self.request(operation, request, None)? {
            self.decode(operation, &reply, |_| Ok(()))?;
        }
        Ok(())
    }

    fn summary(&self, operation: &'static str, request: &ControlRequest) -> Result<Option<String>> {
        match self.request(operation, request, None)? {
            Some(reply) => self
                .decode(operation, &reply, |r| Ok(r.string()?.to_string()))
                .map(Some),
            None => Ok(None),
        }
    }

    fn value(&self, operation: &'static str, request: &ControlRequest) -> Result<Option<Value>> {
        let Some(reply) = self.request(operation, request, None)? else {
            return Ok(None);
        };
        let text = self.decode(operation, &reply, |r| {
            Ok(r.optional_string()?.map(str::to_string))
        })?;
        match text {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|err| Error::protocol_fault(operation, format!("value is not JSON: {err}"))),
            None => Ok(None),
        }
    }

    /// Reads a reply's frames; any shape mismatch is a protocol fault.
    fn decode<T>(
        &self,
        operation: &'static str,
        reply: &Message,
        read: impl for<'a> FnOnce(&mut FrameReader<'a>) -> std::result::Result<T, ProtoError>,
    ) -> Result<T> {
        let mut reader = reply.reader();
        let decoded = read(&mut reader).and_then(|value| reader.finish().map(|()| value));
        decoded.map_err(|err| {
            let err = Error::protocol_fault(operation, err.to_string());
            self.lose_contact(err.to_string());
            err
        })
    }

    fn port_cache(&self, direction: Direction) -> &ArcSwapOption<Vec<Arc<PublishedPort>>> {
        match direction {
            Direction::Input => &self.published_inputs,
            Direction::Output => &self.published_outputs,
        }
    }

    fn published_ports(&self, direction: Direction) -> Result<Vec<Arc<PublishedPort>>> {
        let cache = self.port_cache(direction);
        if let Some(ports) = cache.load_full() {
            return Ok(ports.as_ref().clone());
        }
        if !self.is_active() {
            return Ok(Vec::new());
        }

        self.run_while_draining(|| {
            let mut control = self.control.lock();
            if let Some(ports) = cache.load_full() {
                return Ok(ports.as_ref().clone());
            }
            let Some(ports) = self.discover_locked(&mut control, direction)? else {
                return Ok(Vec::new());
            };
            tracing::debug!(?direction, count = ports.len(), "published ports discovered");
            cache.store(Some(Arc::new(ports.clone())));
            Ok(ports)
        })
    }

    fn discover_locked(
        &self,
        control: &mut ControlState,
        direction: Direction,
    ) -> Result<Option<Vec<Arc<PublishedPort>>>> {
        const OPERATION: &str = "published port discovery";
        let timeout = Some(self.options.discovery_timeout());
        let mut lists = Vec::with_capacity(3);
        for request in direction.discovery_requests() {
            let Some(reply) = self.exchange_locked(control, OPERATION, &request, timeout)? else {
                return Ok(None);
            };
            lists.push(self.decode(OPERATION, &reply, |r| r.string_list())?);
        }
        let [names, types, details]: [Vec<String>; 3] = lists
            .try_into()
            .map_err(|_| Error::protocol_fault(OPERATION, "incomplete discovery"))?;
        if names.len() != types.len() || names.len() != details.len() {
            let err = Error::protocol_fault(
                OPERATION,
                format!(
                    "{} names, {} types, {} details",
                    names.len(),
                    types.len(),
                    details.len()
                ),
            );
            self.lose_contact(err.to_string());
            return Err(err);
        }

        let ports = names
            .into_iter()
            .zip(types)
            .zip(details)
            .map(|((name, type_name), details)| {
                let details = parse_details(&name, &details);
                Arc::new(PublishedPort::new(name, type_name, details))
            })
            .collect();
        Ok(Some(ports))
    }
}

fn parse_details(port: &str, details: &str) -> Value {
    if details.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str(details) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(port, error = %err, "published port details are not JSON");
            Value::Object(Default::default())
        },
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_details;

    #[test]
    fn unparseable_details_become_an_empty_object() {
        assert_eq!(parse_details("a", ""), json!({}));
        assert_eq!(parse_details("a", "{not json"), json!({}));
        assert_eq!(
            parse_details("a", r#"{"default": 3}"#),
            json!({"default": 3})
        );
    }
}
