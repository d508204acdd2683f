//! # Dispatch
//!
//! Handler contract of the consumer loop, plus a registry that routes
//! envelopes to typed handlers by their `(source, kind)` tag.
//!
//! A [`DispatchTable`] is built once at startup. Registering the same tag
//! twice fails at build time, and [`DispatchTable::validate_covers`] fails
//! when an expected tag has no handler, so routing gaps surface before the
//! first delivery instead of as discarded messages.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use bf_envelope::{Envelope, MessageKind};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::DispatchError;

/// Outcome of handling one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Processed; acknowledge.
    Accept,
    /// Not processed; hand back for redelivery.
    Retry,
    /// Never processable; reject without requeue.
    Discard,
}

impl From<bool> for Verdict {
    fn from(accepted: bool) -> Self {
        if accepted {
            Self::Accept
        } else {
            Self::Retry
        }
    }
}

/// Application side of a consumer loop.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Verdict;
}

#[async_trait]
impl<H> EnvelopeHandler for Arc<H>
where
    H: EnvelopeHandler + ?Sized,
{
    async fn handle(&self, envelope: &Envelope) -> Verdict {
        (**self).handle(envelope).await
    }
}

/// Handler built from a closure returning `true` (accept) or `false`
/// (retry).
pub struct FnHandler<F>(F);

/// Wrap a synchronous closure as a handler.
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&Envelope) -> bool + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> EnvelopeHandler for FnHandler<F>
where
    F: Fn(&Envelope) -> bool + Send + Sync,
{
    async fn handle(&self, envelope: &Envelope) -> Verdict {
        (self.0)(envelope).into()
    }
}

#[async_trait]
trait Route: Send + Sync {
    async fn invoke(&self, envelope: &Envelope) -> Verdict;
}

struct TypedRoute<T, F> {
    handler: F,
    _entity: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> Route for TypedRoute<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Verdict> + Send,
{
    async fn invoke(&self, envelope: &Envelope) -> Verdict {
        match envelope.entity_as::<T>() {
            Ok(entity) => (self.handler)(entity).await,
            Err(e) => {
                warn!(
                    source = %envelope.source,
                    kind = %envelope.kind,
                    error = %e,
                    "Entity does not match the registered type, discarding"
                );
                Verdict::Discard
            }
        }
    }
}

type Tag = (String, MessageKind);

/// Collects typed routes.
#[derive(Default)]
pub struct DispatchTableBuilder {
    routes: Vec<(Tag, Box<dyn Route>)>,
}

impl DispatchTableBuilder {
    /// Route `(source, kind)` to `handler`, decoding the entity as `T`.
    #[must_use]
    pub fn on<T, F, Fut>(mut self, source: &str, kind: MessageKind, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Verdict> + Send + 'static,
    {
        let route = TypedRoute {
            handler,
            _entity: PhantomData,
        };
        self.routes.push(((source.to_string(), kind), Box::new(route)));
        self
    }

    /// # Errors
    ///
    /// `DispatchError::Duplicate` if a tag was registered twice.
    pub fn build(self) -> Result<DispatchTable, DispatchError> {
        let mut routes: HashMap<Tag, Box<dyn Route>> = HashMap::new();
        for (tag, route) in self.routes {
            if routes.contains_key(&tag) {
                let (origin, kind) = tag;
                return Err(DispatchError::Duplicate { origin, kind });
            }
            routes.insert(tag, route);
        }
        Ok(DispatchTable { routes })
    }
}

/// Routes envelopes to typed handlers by `(source, kind)`.
pub struct DispatchTable {
    routes: HashMap<Tag, Box<dyn Route>>,
}

impl DispatchTable {
    #[must_use]
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::default()
    }

    /// Returns true if `(source, kind)` has a handler.
    #[must_use]
    pub fn handles(&self, source: &str, kind: MessageKind) -> bool {
        self.routes.contains_key(&(source.to_string(), kind))
    }

    /// Fail unless every expected tag has a handler.
    ///
    /// # Errors
    ///
    /// `DispatchError::Missing` naming the first uncovered tag.
    pub fn validate_covers(&self, expected: &[(&str, MessageKind)]) -> Result<(), DispatchError> {
        match expected
            .iter()
            .find(|(source, kind)| !self.handles(source, *kind))
        {
            Some((source, kind)) => Err(DispatchError::Missing {
                origin: (*source).to_string(),
                kind: *kind,
            }),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[async_trait]
impl EnvelopeHandler for DispatchTable {
    async fn handle(&self, envelope: &Envelope) -> Verdict {
        let tag = (envelope.source.clone(), envelope.kind);
        match self.routes.get(&tag) {
            Some(route) => route.invoke(envelope).await,
            None => {
                warn!(
                    source = %envelope.source,
                    kind = %envelope.kind,
                    "No handler registered for message, discarding"
                );
                Verdict::Discard
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Serialize, Deserialize)]
    struct Portfolio {
        id: u32,
    }

    fn envelope<T: Serialize>(source: &str, kind: MessageKind, entity: &T) -> Envelope {
        Envelope::wrap(source, kind, entity).unwrap()
    }

    #[tokio::test]
    async fn test_routes_by_tag_and_decodes_entity() {
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let table = DispatchTable::builder()
            .on("inventory", MessageKind::Create, move |p: Portfolio| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.store(p.id, Ordering::SeqCst);
                    Verdict::Accept
                }
            })
            .on("inventory", MessageKind::Delete, |_: Portfolio| async { Verdict::Retry })
            .build()
            .unwrap();

        let verdict = table
            .handle(&envelope("inventory", MessageKind::Create, &Portfolio { id: 9 }))
            .await;
        assert_eq!(verdict, Verdict::Accept);
        assert_eq!(seen.load(Ordering::SeqCst), 9);

        let verdict = table
            .handle(&envelope("inventory", MessageKind::Delete, &Portfolio { id: 1 }))
            .await;
        assert_eq!(verdict, Verdict::Retry);
    }

    #[tokio::test]
    async fn test_unknown_tag_and_bad_entity_are_discarded() {
        let table = DispatchTable::builder()
            .on("inventory", MessageKind::Create, |_: Portfolio| async { Verdict::Accept })
            .build()
            .unwrap();

        let unknown = envelope("billing", MessageKind::Create, &Portfolio { id: 1 });
        assert_eq!(table.handle(&unknown).await, Verdict::Discard);

        let wrong_shape = envelope("inventory", MessageKind::Create, &"not a portfolio");
        assert_eq!(table.handle(&wrong_shape).await, Verdict::Discard);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let result = DispatchTable::builder()
            .on("inventory", MessageKind::Update, |_: Portfolio| async { Verdict::Accept })
            .on("inventory", MessageKind::Update, |_: Portfolio| async { Verdict::Accept })
            .build();

        assert!(matches!(
            result,
            Err(DispatchError::Duplicate { kind: MessageKind::Update, .. })
        ));
    }

    #[test]
    fn test_validate_covers() {
        let table = DispatchTable::builder()
            .on("inventory", MessageKind::Create, |_: Portfolio| async { Verdict::Accept })
            .build()
            .unwrap();

        assert!(table
            .validate_covers(&[("inventory", MessageKind::Create)])
            .is_ok());
        let err = table
            .validate_covers(&[
                ("inventory", MessageKind::Create),
                ("inventory", MessageKind::Delete),
            ])
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::Missing {
                origin: "inventory".into(),
                kind: MessageKind::Delete
            }
        );
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = handler_fn(|e: &Envelope| e.source == "ok");
        assert_eq!(
            handler.handle(&envelope("ok", MessageKind::Create, &1)).await,
            Verdict::Accept
        );
        assert_eq!(
            handler.handle(&envelope("no", MessageKind::Create, &1)).await,
            Verdict::Retry
        );
    }
}
