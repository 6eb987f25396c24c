//! Message registry: the table that maps wire type identifiers to schemas.
//!
//! A [`Registry`] is assembled once with a [`RegistryBuilder`] and is
//! immutable afterwards, so clients share it through an `Arc` without locking.
//! Each entry ([`MessageMeta`]) knows how to decode payload bytes into its
//! concrete Rust type and may carry a default [`Handler`].
//!
//! For programs that prefer registering schemas from scattered call sites,
//! [`global`] offers a process-wide builder that is frozen the first time a
//! [`Client`](crate::Client) is created from it.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use paynet_core::{decode_payload, Message, MessageType, PayloadError};
use serde::de::DeserializeOwned;

use crate::application::handler::Handler;
use crate::domain::error::{DuplicateField, RegistryError};

/// Decodes payload bytes into a boxed instance of one concrete schema type.
pub type DecodeFn = fn(&[u8]) -> Result<Box<dyn Message>, PayloadError>;

fn decode_boxed<M>(payload: &[u8]) -> Result<Box<dyn Message>, PayloadError>
where
    M: Message + DeserializeOwned,
{
    Ok(Box::new(decode_payload::<M>(payload)?))
}

/// Registry entry describing one message schema.
#[derive(Clone)]
pub struct MessageMeta {
    pub message_type: MessageType,
    /// Unique, human-readable name such as `"paybox.CoinAck"`.
    pub name: String,
    rust_type: TypeId,
    rust_type_name: &'static str,
    decode: DecodeFn,
    handler: Option<Arc<dyn Handler>>,
}

impl MessageMeta {
    /// Describes schema `M` travelling under `message_type`.
    pub fn of<M>(message_type: MessageType, name: impl Into<String>) -> Self
    where
        M: Message + DeserializeOwned,
    {
        Self {
            message_type,
            name: name.into(),
            rust_type: TypeId::of::<M>(),
            rust_type_name: type_name::<M>(),
            decode: decode_boxed::<M>,
            handler: None,
        }
    }

    /// Attaches a default handler used when no client subscription overrides it.
    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Decodes `payload` into the registered schema type.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Decode`] if the bytes are not a valid instance.
    pub fn decode(&self, payload: &[u8]) -> Result<Box<dyn Message>, PayloadError> {
        (self.decode)(payload)
    }

    pub fn handler(&self) -> Option<&Arc<dyn Handler>> {
        self.handler.as_ref()
    }

    /// Fully qualified name of the Rust schema type.
    pub fn rust_type_name(&self) -> &'static str {
        self.rust_type_name
    }
}

impl fmt::Debug for MessageMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageMeta")
            .field("message_type", &self.message_type)
            .field("name", &self.name)
            .field("rust_type", &self.rust_type_name)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Immutable schema table shared by every client built from it.
#[derive(Debug, Default)]
pub struct Registry {
    by_type: HashMap<MessageType, MessageMeta>,
    by_name: HashMap<String, MessageType>,
    by_rust_type: HashMap<TypeId, MessageType>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Looks up the entry for a wire type.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if nothing is registered under `message_type`.
    pub fn lookup(&self, message_type: MessageType) -> Result<&MessageMeta, RegistryError> {
        self.by_type
            .get(&message_type)
            .ok_or(RegistryError::NotFound(message_type))
    }

    /// Looks up the entry registered under `name`.
    pub fn lookup_name(&self, name: &str) -> Result<&MessageMeta, RegistryError> {
        self.by_name
            .get(name)
            .and_then(|t| self.by_type.get(t))
            .ok_or_else(|| RegistryError::NameNotFound(name.to_string()))
    }

    /// Wire type registered for schema `M`.
    pub fn type_of<M: Message>(&self) -> Result<MessageType, RegistryError> {
        self.by_rust_type
            .get(&TypeId::of::<M>())
            .copied()
            .ok_or(RegistryError::SchemaNotRegistered(type_name::<M>()))
    }

    /// Wire type registered for the concrete type behind `msg`.
    pub fn type_of_message(&self, msg: &dyn Message) -> Result<MessageType, RegistryError> {
        self.by_rust_type
            .get(&Any::type_id(msg.as_any()))
            .copied()
            .ok_or(RegistryError::SchemaNotRegistered(msg.type_name()))
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    fn insert(&mut self, meta: MessageMeta) -> Result<(), RegistryError> {
        let duplicate = if self.by_type.contains_key(&meta.message_type) {
            Some(DuplicateField::Type)
        } else if self.by_name.contains_key(&meta.name) {
            Some(DuplicateField::Name)
        } else {
            None
        };
        if let Some(field) = duplicate {
            return Err(RegistryError::DuplicateRegistration {
                message_type: meta.message_type,
                name: meta.name,
                field,
            });
        }

        // The first wire type registered for a Rust type wins type inference.
        self.by_rust_type
            .entry(meta.rust_type)
            .or_insert(meta.message_type);
        self.by_name.insert(meta.name.clone(), meta.message_type);
        self.by_type.insert(meta.message_type, meta);
        Ok(())
    }
}

/// Collects [`MessageMeta`] entries and produces a [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    registry: Registry,
}

impl RegistryBuilder {
    /// Adds an entry.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DuplicateRegistration`] if the type identifier or the
    /// name is already present; the builder is left unchanged.
    pub fn register(&mut self, meta: MessageMeta) -> Result<&mut Self, RegistryError> {
        self.registry.insert(meta)?;
        Ok(self)
    }

    pub fn build(self) -> Registry {
        self.registry
    }
}

/// Entries for the standard paybox messages, without handlers.
pub fn paybox_schema() -> Vec<MessageMeta> {
    use paynet_core::protocol::paybox::*;

    vec![
        MessageMeta::of::<RegisterReq>(TYPE_REGISTER_REQ, "paybox.RegisterReq"),
        MessageMeta::of::<RegisterRsp>(TYPE_REGISTER_RSP, "paybox.RegisterRsp"),
        MessageMeta::of::<LoginReq>(TYPE_LOGIN_REQ, "paybox.LoginReq"),
        MessageMeta::of::<LoginRsp>(TYPE_LOGIN_RSP, "paybox.LoginRsp"),
        MessageMeta::of::<Ping>(TYPE_PING, "paybox.Ping"),
        MessageMeta::of::<Pong>(TYPE_PONG, "paybox.Pong"),
        MessageMeta::of::<ErrorMsg>(TYPE_ERROR, "paybox.Error"),
        MessageMeta::of::<CoinCommand>(TYPE_COIN_COMMAND, "paybox.CoinCommand"),
        MessageMeta::of::<CoinAck>(TYPE_COIN_ACK, "paybox.CoinAck"),
        MessageMeta::of::<QueryReq>(TYPE_QUERY_REQ, "paybox.QueryReq"),
        MessageMeta::of::<QueryRsp>(TYPE_QUERY_RSP, "paybox.QueryRsp"),
    ]
}

// ── Process-wide registry ─────────────────────────────────────────────────────

/// A process-wide registry that accepts registrations until it is frozen.
pub mod global {
    use std::sync::{Arc, Mutex, OnceLock, PoisonError};

    use tracing::debug;

    use super::{MessageMeta, Registry, RegistryBuilder};
    use crate::domain::error::RegistryError;

    enum GlobalState {
        Open(RegistryBuilder),
        Frozen(Arc<Registry>),
    }

    fn state() -> &'static Mutex<GlobalState> {
        static STATE: OnceLock<Mutex<GlobalState>> = OnceLock::new();
        STATE.get_or_init(|| Mutex::new(GlobalState::Open(RegistryBuilder::default())))
    }

    /// Registers a schema in the process-wide registry.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Frozen`] once a client has been created from the
    /// global registry, or [`RegistryError::DuplicateRegistration`].
    pub fn register(meta: MessageMeta) -> Result<(), RegistryError> {
        let mut guard = state().lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *guard {
            GlobalState::Open(builder) => {
                debug!(message_type = %meta.message_type, name = %meta.name, "registering message");
                builder.register(meta).map(|_| ())
            }
            GlobalState::Frozen(_) => Err(RegistryError::Frozen),
        }
    }

    /// Like [`register`], but a failure is a programming error.
    ///
    /// # Panics
    ///
    /// Panics on a duplicate registration or a frozen registry.
    pub fn must_register(meta: MessageMeta) {
        let name = meta.name.clone();
        if let Err(e) = register(meta) {
            panic!("failed to register message {name:?}: {e}");
        }
    }

    /// Freezes the process-wide registry and returns it.  Idempotent.
    pub fn freeze() -> Arc<Registry> {
        let mut guard = state().lock().unwrap_or_else(PoisonError::into_inner);
        let registry = match std::mem::replace(
            &mut *guard,
            GlobalState::Frozen(Arc::new(Registry::default())),
        ) {
            GlobalState::Open(builder) => Arc::new(builder.build()),
            GlobalState::Frozen(registry) => registry,
        };
        *guard = GlobalState::Frozen(Arc::clone(&registry));
        registry
    }

    pub fn is_frozen() -> bool {
        matches!(
            &*state().lock().unwrap_or_else(PoisonError::into_inner),
            GlobalState::Frozen(_)
        )
    }
}
