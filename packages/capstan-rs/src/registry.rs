//! Subscriber registry: request type → ordered handler registrations.
//!
//! Built during startup through the processor builder and read-only
//! afterwards; readers take no locks.

use std::any::TypeId;
use std::collections::HashMap;

use anyhow::Result;

use crate::error::CapstanError;
use crate::handler::HandlerRegistration;
use crate::request::Request;

/// Whether a request type dispatches one-to-one or fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplicity {
    /// Send-style: exactly one handler.
    One,
    /// Publish-style: zero or more handlers.
    Many,
}

/// The handlers subscribed to one request type.
pub struct Subscription {
    /// One-to-one (Send) or one-to-many (Publish).
    pub multiplicity: Multiplicity,
    /// Handler registrations in declaration order.
    pub handlers: Vec<HandlerRegistration>,
    /// Human-readable request type name for diagnostics.
    pub type_name: &'static str,
}

/// Maps request types to their handler registrations.
#[derive(Default)]
pub struct SubscriberRegistry {
    routes: HashMap<TypeId, Subscription>,
}

impl SubscriberRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the single handler for a command type.
    ///
    /// Errors if the type already has a registration: commands are strictly
    /// one-to-one.
    pub fn register_command<R: Request>(
        &mut self,
        registration: HandlerRegistration,
    ) -> Result<()> {
        let type_id = TypeId::of::<R>();
        if self.routes.contains_key(&type_id) {
            return Err(CapstanError::configuration(format!(
                "command {} already has a handler registered",
                std::any::type_name::<R>()
            ))
            .into());
        }
        self.routes.insert(
            type_id,
            Subscription {
                multiplicity: Multiplicity::One,
                handlers: vec![registration],
                type_name: std::any::type_name::<R>(),
            },
        );
        Ok(())
    }

    /// Register an additional handler for an event or document type.
    ///
    /// Errors if the type was registered as a command.
    pub fn register_event<R: Request>(
        &mut self,
        registration: HandlerRegistration,
    ) -> Result<()> {
        let type_id = TypeId::of::<R>();
        match self.routes.get_mut(&type_id) {
            Some(subscription) => {
                if subscription.multiplicity == Multiplicity::One {
                    return Err(CapstanError::configuration(format!(
                        "{} is registered as a command, cannot add fan-out handlers",
                        std::any::type_name::<R>()
                    ))
                    .into());
                }
                subscription.handlers.push(registration);
            }
            None => {
                self.routes.insert(
                    type_id,
                    Subscription {
                        multiplicity: Multiplicity::Many,
                        handlers: vec![registration],
                        type_name: std::any::type_name::<R>(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Look up the subscription for a request type.
    pub fn lookup(&self, type_id: TypeId) -> Option<&Subscription> {
        self.routes.get(&type_id)
    }

    /// Number of registered request types.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field(
                "types",
                &self.routes.values().map(|s| s.type_name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Handler, HandlerRegistration};
    use crate::request::RequestKind;
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    struct ACommand {
        id: String,
    }

    impl Request for ACommand {
        fn id(&self) -> &str {
            &self.id
        }

        fn request_kind(&self) -> RequestKind {
            RequestKind::Command
        }
    }

    #[derive(Debug, Clone)]
    struct AnEvent {
        id: String,
    }

    impl Request for AnEvent {
        fn id(&self) -> &str {
            &self.id
        }

        fn request_kind(&self) -> RequestKind {
            RequestKind::Event
        }
    }

    struct NoOpHandler;

    #[async_trait::async_trait]
    impl Handler for NoOpHandler {
        async fn handle(
            &self,
            _request: &dyn crate::request::AnyRequest,
            _ctx: &crate::handler::DispatchContext,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registration(name: &'static str) -> HandlerRegistration {
        HandlerRegistration::new(name, || Ok(Arc::new(NoOpHandler) as Arc<dyn Handler>))
    }

    #[test]
    fn test_command_registration_is_one_to_one() {
        let mut registry = SubscriberRegistry::new();
        registry
            .register_command::<ACommand>(registration("H1"))
            .unwrap();

        let err = registry
            .register_command::<ACommand>(registration("H2"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CapstanError>(),
            Some(CapstanError::Configuration { .. })
        ));

        let sub = registry.lookup(TypeId::of::<ACommand>()).unwrap();
        assert_eq!(sub.multiplicity, Multiplicity::One);
        assert_eq!(sub.handlers.len(), 1);
    }

    #[test]
    fn test_event_registrations_accumulate_in_order() {
        let mut registry = SubscriberRegistry::new();
        registry
            .register_event::<AnEvent>(registration("H1"))
            .unwrap();
        registry
            .register_event::<AnEvent>(registration("H2"))
            .unwrap();

        let sub = registry.lookup(TypeId::of::<AnEvent>()).unwrap();
        assert_eq!(sub.multiplicity, Multiplicity::Many);
        let names: Vec<_> = sub.handlers.iter().map(|h| h.name).collect();
        assert_eq!(names, ["H1", "H2"]);
    }

    #[test]
    fn test_event_on_command_type_is_rejected() {
        let mut registry = SubscriberRegistry::new();
        registry
            .register_command::<ACommand>(registration("H1"))
            .unwrap();

        let err = registry
            .register_event::<ACommand>(registration("H2"))
            .unwrap_err();
        assert!(err.to_string().contains("registered as a command"));
    }

    #[test]
    fn test_lookup_missing_type() {
        let registry = SubscriberRegistry::new();
        assert!(registry.lookup(TypeId::of::<ACommand>()).is_none());
        assert!(registry.is_empty());
    }
}
