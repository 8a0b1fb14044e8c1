// ============================================================================
// Broker topology
// ============================================================================
//
//   relay.events   (topic)  ── message.*      ──▶ relay.inbound
//   relay.commands (topic)  ── command.send.* ──▶ relay.outbound
//   relay.dlx      (direct) ── <queue name>   ──▶ relay.dead_letters
//
// Every application queue carries x-dead-letter-exchange = relay.dlx and
// x-dead-letter-routing-key = its own name, so a rejected delivery lands in
// the dead-letter queue still identifiable by origin.
//
// ============================================================================

use super::{Binding, Broker, BrokerResult, ExchangeSpec, QueueSpec};
use relay_config::BrokerConfig;
use relay_types::EventKind;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<Binding>,
}

impl Topology {
    /// The relay's standard layout
    pub fn from_config(config: &BrokerConfig) -> Self {
        let mut topology = Topology {
            exchanges: vec![
                ExchangeSpec::topic(&config.events_exchange),
                ExchangeSpec::topic(&config.commands_exchange),
                ExchangeSpec::direct(&config.dead_letter_exchange),
            ],
            // The dead-letter queue has no DLX of its own
            queues: vec![QueueSpec::durable(&config.dead_letter_queue)],
            bindings: Vec::new(),
        };

        topology.add_application_queue(
            config,
            &config.inbound_queue,
            Some(Binding::new(
                &config.inbound_queue,
                &config.events_exchange,
                format!("{}.*", EventKind::MessageReceived.routing_prefix()),
            )),
        );
        topology.add_application_queue(
            config,
            &config.outbound_queue,
            Some(Binding::new(
                &config.outbound_queue,
                &config.commands_exchange,
                format!("{}.*", EventKind::SendCommand.routing_prefix()),
            )),
        );
        topology
    }

    /// Queue spec for an application queue, dead-lettering to the DLX
    pub fn application_queue(config: &BrokerConfig, name: &str) -> QueueSpec {
        QueueSpec::durable(name).with_dead_letter(&config.dead_letter_exchange, name)
    }

    /// Add an application queue, its dead-letter binding and an optional
    /// source binding. Returns `false` if the queue was already present.
    pub fn add_application_queue(
        &mut self,
        config: &BrokerConfig,
        name: &str,
        source: Option<Binding>,
    ) -> bool {
        if self.contains_queue(name) {
            return false;
        }
        self.queues.push(Self::application_queue(config, name));
        self.bindings.push(Binding::new(
            &config.dead_letter_queue,
            &config.dead_letter_exchange,
            name,
        ));
        if let Some(binding) = source {
            self.bindings.push(binding);
        }
        true
    }

    pub fn contains_queue(&self, name: &str) -> bool {
        self.queues.iter().any(|q| q.name == name)
    }

    /// Declare everything: exchanges, then queues, then bindings.
    /// Safe to repeat.
    pub async fn declare_all(&self, broker: &dyn Broker) -> BrokerResult<()> {
        for exchange in &self.exchanges {
            broker.declare_exchange(exchange).await?;
        }
        for queue in &self.queues {
            broker.declare_queue(queue).await?;
        }
        for binding in &self.bindings {
            broker.bind_queue(binding).await?;
        }

        tracing::info!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.bindings.len(),
            "Broker topology declared"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ExchangeKind, MemoryBroker};

    #[test]
    fn test_standard_layout() {
        let config = BrokerConfig::default();
        let topology = Topology::from_config(&config);

        assert_eq!(topology.exchanges.len(), 3);
        assert_eq!(topology.exchanges[2].kind, ExchangeKind::Direct);

        let outbound = topology
            .queues
            .iter()
            .find(|q| q.name == config.outbound_queue)
            .unwrap();
        assert_eq!(
            outbound.arguments.dead_letter_exchange.as_deref(),
            Some("relay.dlx")
        );
        assert_eq!(
            outbound.arguments.dead_letter_routing_key.as_deref(),
            Some("relay.outbound")
        );

        assert!(topology.bindings.contains(&Binding::new(
            "relay.inbound",
            "relay.events",
            "message.*"
        )));
        assert!(topology.bindings.contains(&Binding::new(
            "relay.dead_letters",
            "relay.dlx",
            "relay.outbound"
        )));
    }

    #[test]
    fn test_add_application_queue_is_idempotent() {
        let config = BrokerConfig::default();
        let mut topology = Topology::from_config(&config);
        let before = topology.clone();

        assert!(!topology.add_application_queue(&config, "relay.inbound", None));
        assert_eq!(topology, before);

        assert!(topology.add_application_queue(&config, "relay.extra", None));
        assert!(topology.contains_queue("relay.extra"));
    }

    #[tokio::test]
    async fn test_declare_all_twice_leaves_same_state() {
        let broker = MemoryBroker::new();
        let topology = Topology::from_config(&BrokerConfig::default());

        topology.declare_all(&broker).await.unwrap();
        let queues = broker.queue_names();
        let bindings = broker.bindings();

        topology.declare_all(&broker).await.unwrap();
        assert_eq!(broker.queue_names(), queues);
        assert_eq!(broker.bindings(), bindings);
    }
}
