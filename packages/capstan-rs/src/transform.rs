//! Wrap/unwrap transform pipelines.
//!
//! Two symmetric pipelines exist per request type:
//!
//! - **Wrap** (publish side): the mapper converts the request to a message,
//!   then transforms apply in step order (compression, claim checks, ...).
//! - **Unwrap** (consume side): transforms apply in reverse step order,
//!   then the mapper converts the message back to a request.
//!
//! Transforms are declared as descriptor data on the mapper registration -
//! an integer step index plus a factory - rather than discovered by runtime
//! reflection. Ties break by declaration order.
//!
//! One pipeline instance exists per (request type, direction), built
//! lazily and shared across concurrent callers; the cache is clearable for
//! tests. A missing mapper or a failing transform factory is a
//! configuration error; translation failures are mapping errors.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;

use crate::error::CapstanError;
use crate::message::Message;
use crate::request::{AnyRequest, Request};

/// Converts between a request and its message representation.
///
/// The final step of the wrap pipeline and the first of the unwrap
/// pipeline. Mappers set the routing key: `map_to_message` decides the
/// topic a request publishes to.
pub trait MessageMapper: Send + Sync {
    /// Convert a request to a message.
    fn map_to_message(&self, request: &dyn AnyRequest) -> Result<Message>;

    /// Convert a message back to a request.
    fn map_to_request(&self, message: &Message) -> Result<Box<dyn AnyRequest>>;
}

/// A message-to-message step in the wrap/unwrap pipeline.
///
/// `unwrap` must invert `wrap`: a transform that compresses on the way out
/// decompresses on the way in.
pub trait MessageTransform: Send + Sync {
    /// Apply the publish-side transformation.
    fn wrap(&self, message: Message) -> Result<Message>;

    /// Invert the transformation on the consume side.
    fn unwrap(&self, message: Message) -> Result<Message>;
}

type TransformFactory = Arc<dyn Fn() -> Result<Arc<dyn MessageTransform>> + Send + Sync>;

/// Declares one transform on a mapper registration.
#[derive(Clone)]
pub struct TransformDescriptor {
    /// Ordering index; wrap applies ascending, unwrap descending.
    pub step: u32,
    factory: TransformFactory,
}

impl TransformDescriptor {
    /// Declare a transform at the given step.
    pub fn new(
        step: u32,
        factory: impl Fn() -> Result<Arc<dyn MessageTransform>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            step,
            factory: Arc::new(factory),
        }
    }
}

/// A mapper plus its declared transforms for one request type.
#[derive(Clone)]
pub struct MapperRegistration {
    mapper: Arc<dyn MessageMapper>,
    transforms: Vec<TransformDescriptor>,
}

impl MapperRegistration {
    /// Register a mapper with no transforms.
    pub fn new(mapper: Arc<dyn MessageMapper>) -> Self {
        Self {
            mapper,
            transforms: Vec::new(),
        }
    }

    /// Declare a transform on this mapper.
    pub fn with_transform(mut self, descriptor: TransformDescriptor) -> Self {
        self.transforms.push(descriptor);
        self
    }
}

/// A built publish-side pipeline: mapper then transforms in step order.
pub struct WrapPipeline {
    mapper: Arc<dyn MessageMapper>,
    transforms: Vec<Arc<dyn MessageTransform>>,
}

impl std::fmt::Debug for WrapPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrapPipeline")
            .field("transforms_count", &self.transforms.len())
            .finish()
    }
}

impl WrapPipeline {
    /// Wrap a request into its on-wire message.
    pub fn wrap(&self, request: &dyn AnyRequest) -> Result<Message> {
        let mut message = self.mapper.map_to_message(request)?;
        for transform in &self.transforms {
            message = transform.wrap(message)?;
        }
        Ok(message)
    }
}

/// A built consume-side pipeline: transforms in reverse step order, then
/// the mapper.
pub struct UnwrapPipeline {
    mapper: Arc<dyn MessageMapper>,
    transforms: Vec<Arc<dyn MessageTransform>>,
}

impl UnwrapPipeline {
    /// Unwrap an on-wire message back into a request.
    pub fn unwrap(&self, message: &Message) -> Result<Box<dyn AnyRequest>> {
        let mut message = message.clone();
        for transform in self.transforms.iter().rev() {
            message = transform.unwrap(message)?;
        }
        self.mapper.map_to_request(&message)
    }
}

/// Holds mapper registrations and the lazily-built pipeline caches.
pub struct TransformRegistry {
    mappers: HashMap<TypeId, (MapperRegistration, &'static str)>,
    wrap_cache: DashMap<TypeId, Arc<WrapPipeline>>,
    unwrap_cache: DashMap<TypeId, Arc<UnwrapPipeline>>,
}

impl TransformRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            mappers: HashMap::new(),
            wrap_cache: DashMap::new(),
            unwrap_cache: DashMap::new(),
        }
    }

    /// Register the mapper for a request type, replacing any existing one.
    pub fn register<R: Request>(&mut self, registration: MapperRegistration) {
        self.mappers.insert(
            TypeId::of::<R>(),
            (registration, std::any::type_name::<R>()),
        );
    }

    fn registration(&self, type_id: TypeId) -> Result<&(MapperRegistration, &'static str)> {
        self.mappers.get(&type_id).ok_or_else(|| {
            CapstanError::configuration(format!(
                "no message mapper registered for request type {type_id:?}"
            ))
            .into()
        })
    }

    /// Instantiate the transforms for a registration, sorted by step
    /// ascending with ties in declaration order.
    fn build_transforms(
        registration: &MapperRegistration,
        type_name: &str,
    ) -> Result<Vec<Arc<dyn MessageTransform>>> {
        let mut indices: Vec<usize> = (0..registration.transforms.len()).collect();
        indices.sort_by_key(|&i| registration.transforms[i].step);

        let mut transforms = Vec::with_capacity(indices.len());
        for index in indices {
            let transform = (registration.transforms[index].factory)().map_err(|e| {
                CapstanError::configuration(format!(
                    "transform factory (step {}) for {type_name} failed: {e}",
                    registration.transforms[index].step
                ))
            })?;
            transforms.push(transform);
        }
        Ok(transforms)
    }

    /// The wrap pipeline for a request type, built on first use.
    pub fn wrap_pipeline(&self, type_id: TypeId) -> Result<Arc<WrapPipeline>> {
        if let Some(pipeline) = self.wrap_cache.get(&type_id) {
            return Ok(pipeline.clone());
        }
        let (registration, type_name) = self.registration(type_id)?;
        let pipeline = Arc::new(WrapPipeline {
            mapper: registration.mapper.clone(),
            transforms: Self::build_transforms(registration, type_name)?,
        });
        self.wrap_cache.insert(type_id, pipeline.clone());
        Ok(pipeline)
    }

    /// The unwrap pipeline for a request type, built on first use.
    pub fn unwrap_pipeline(&self, type_id: TypeId) -> Result<Arc<UnwrapPipeline>> {
        if let Some(pipeline) = self.unwrap_cache.get(&type_id) {
            return Ok(pipeline.clone());
        }
        let (registration, type_name) = self.registration(type_id)?;
        let pipeline = Arc::new(UnwrapPipeline {
            mapper: registration.mapper.clone(),
            transforms: Self::build_transforms(registration, type_name)?,
        });
        self.unwrap_cache.insert(type_id, pipeline.clone());
        Ok(pipeline)
    }

    /// Drop all cached pipelines. For tests.
    pub fn clear_cache(&self) {
        self.wrap_cache.clear();
        self.unwrap_cache.clear();
    }

    /// Whether a mapper exists for the type.
    pub fn has_mapper(&self, type_id: TypeId) -> bool {
        self.mappers.contains_key(&type_id)
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformRegistry")
            .field("mapper_count", &self.mappers.len())
            .field("cached_wrap", &self.wrap_cache.len())
            .field("cached_unwrap", &self.unwrap_cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageBody, MessageHeader, MessageType};
    use crate::request::RequestKind;

    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    struct OrderPlaced {
        id: String,
    }

    impl Request for OrderPlaced {
        fn id(&self) -> &str {
            &self.id
        }

        fn request_kind(&self) -> RequestKind {
            RequestKind::Event
        }
    }

    struct OrderMapper;

    impl MessageMapper for OrderMapper {
        fn map_to_message(&self, request: &dyn AnyRequest) -> Result<Message> {
            let order = request
                .as_any()
                .downcast_ref::<OrderPlaced>()
                .ok_or_else(|| CapstanError::mapping("not an OrderPlaced"))?;
            let body = MessageBody::json(&serde_json::to_value(order)?);
            Ok(Message::new(
                MessageHeader::new(order.id.clone(), "orders.placed", MessageType::Event),
                body,
            ))
        }

        fn map_to_request(&self, message: &Message) -> Result<Box<dyn AnyRequest>> {
            let order: OrderPlaced = serde_json::from_value(message.body.to_json()?)
                .map_err(|e| CapstanError::mapping(format!("order decode: {e}")))?;
            Ok(Box::new(order))
        }
    }

    /// Tags the bag on wrap, removes the tag on unwrap.
    struct TagTransform {
        tag: &'static str,
    }

    impl MessageTransform for TagTransform {
        fn wrap(&self, mut message: Message) -> Result<Message> {
            let trail = message
                .header
                .bag
                .entry("trail".into())
                .or_insert_with(|| serde_json::json!([]));
            trail
                .as_array_mut()
                .expect("trail is an array")
                .push(serde_json::json!(self.tag));
            Ok(message)
        }

        fn unwrap(&self, mut message: Message) -> Result<Message> {
            if let Some(trail) = message.header.bag.get_mut("trail") {
                let array = trail.as_array_mut().expect("trail is an array");
                assert_eq!(array.pop(), Some(serde_json::json!(self.tag)));
            }
            Ok(message)
        }
    }

    fn tag(step: u32, tag_name: &'static str) -> TransformDescriptor {
        TransformDescriptor::new(step, move || {
            Ok(Arc::new(TagTransform { tag: tag_name }) as Arc<dyn MessageTransform>)
        })
    }

    fn registry_with_transforms() -> TransformRegistry {
        let mut registry = TransformRegistry::new();
        registry.register::<OrderPlaced>(
            MapperRegistration::new(Arc::new(OrderMapper))
                .with_transform(tag(2, "outer"))
                .with_transform(tag(1, "inner")),
        );
        registry
    }

    #[test]
    fn test_wrap_applies_transforms_in_step_order() {
        let registry = registry_with_transforms();
        let pipeline = registry.wrap_pipeline(TypeId::of::<OrderPlaced>()).unwrap();

        let message = pipeline.wrap(&OrderPlaced { id: "o-1".into() }).unwrap();

        assert_eq!(message.header.topic, "orders.placed");
        assert_eq!(
            message.header.bag.get("trail"),
            Some(&serde_json::json!(["inner", "outer"]))
        );
    }

    #[test]
    fn test_unwrap_reverses_wrap() {
        let registry = registry_with_transforms();
        let wrap = registry.wrap_pipeline(TypeId::of::<OrderPlaced>()).unwrap();
        let unwrap = registry
            .unwrap_pipeline(TypeId::of::<OrderPlaced>())
            .unwrap();

        let message = wrap.wrap(&OrderPlaced { id: "o-2".into() }).unwrap();
        let request = unwrap.unwrap(&message).unwrap();

        assert_eq!(request.request_id(), "o-2");
        let order = request.as_any().downcast_ref::<OrderPlaced>().unwrap();
        assert_eq!(order.id, "o-2");
    }

    #[test]
    fn test_missing_mapper_is_configuration_error() {
        let registry = TransformRegistry::new();
        let err = registry
            .wrap_pipeline(TypeId::of::<OrderPlaced>())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CapstanError>(),
            Some(CapstanError::Configuration { .. })
        ));
    }

    #[test]
    fn test_failing_transform_factory_is_configuration_error() {
        let mut registry = TransformRegistry::new();
        registry.register::<OrderPlaced>(
            MapperRegistration::new(Arc::new(OrderMapper)).with_transform(
                TransformDescriptor::new(1, || Err(anyhow::anyhow!("no factory"))),
            ),
        );

        let err = registry
            .wrap_pipeline(TypeId::of::<OrderPlaced>())
            .unwrap_err();
        assert!(err.to_string().contains("transform factory"));
    }

    #[test]
    fn test_pipeline_is_cached_and_clearable() {
        let registry = registry_with_transforms();
        let first = registry.wrap_pipeline(TypeId::of::<OrderPlaced>()).unwrap();
        let second = registry.wrap_pipeline(TypeId::of::<OrderPlaced>()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        registry.clear_cache();
        let third = registry.wrap_pipeline(TypeId::of::<OrderPlaced>()).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_mapping_failure_is_mapping_error() {
        let registry = registry_with_transforms();
        let unwrap = registry
            .unwrap_pipeline(TypeId::of::<OrderPlaced>())
            .unwrap();

        let garbage = Message::new(
            MessageHeader::new("m-x", "orders.placed", MessageType::Event),
            MessageBody {
                bytes: b"not json".to_vec(),
                content_type: "application/json".into(),
            },
        );

        let err = unwrap.unwrap(&garbage).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CapstanError>(),
            Some(CapstanError::MessageMapping { .. })
        ));
    }
}
