//! Explicit `(category, type)` → handler table.
//!
//! Application messages are registered up front, package by package. The
//! finished [`MessageRegistry`] is wrapped in an `Arc` and shared read-only
//! by every connection; adding a package later produces a *new* registry
//! for connections created afterwards, leaving live ones untouched.
//!
//! ```text
//!   bytes ──▶ FrameCodec ──▶ registry.decode(id) ──▶ BoxedHandler<C>
//!                                                        │
//!                               session context &C ──▶ run() ──▶ Dispatch
//! ```

use std::collections::HashMap;
use std::fmt;

use loomwire_tick::Deferred;

use crate::message::{Message, MessageId};
use crate::system::SYSTEM_CATEGORY;
use crate::wire::WireReader;
use crate::ProtocolError;

/// A handler reported that it could not process its message.
///
/// The connection logs this and drops the message; it stays open.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// What a handler wants to happen after it returns.
pub enum Dispatch<C> {
    /// Everything was done inline.
    Done,
    /// Apply this action at the next tick boundary.
    Defer(Deferred<C>),
}

impl<C> fmt::Debug for Dispatch<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => f.write_str("Done"),
            Self::Defer(d) => f.debug_tuple("Defer").field(d).finish(),
        }
    }
}

/// A message that knows what to do when it arrives.
///
/// `C` is the session context attached to the receiving connection. The
/// handler runs on the receiving task and must not block.
pub trait Handle<C>: Message {
    fn handle(self, ctx: &C) -> Result<Dispatch<C>, HandlerError>;
}

/// Object-safe form of [`Handle`], produced by the registry.
pub trait ErasedHandler<C>: Send {
    /// Header of the decoded message.
    fn message_id(&self) -> MessageId;

    /// Consumes the decoded message and runs its handler.
    fn run(self: Box<Self>, ctx: &C) -> Result<Dispatch<C>, HandlerError>;
}

impl<C, M: Handle<C>> ErasedHandler<C> for M {
    fn message_id(&self) -> MessageId {
        M::id()
    }

    fn run(self: Box<Self>, ctx: &C) -> Result<Dispatch<C>, HandlerError> {
        Handle::handle(*self, ctx)
    }
}

/// A decoded message waiting to be dispatched.
pub type BoxedHandler<C> = Box<dyn ErasedHandler<C>>;

type DecodeFn<C> = fn(&mut WireReader<'_>) -> Result<BoxedHandler<C>, ProtocolError>;

fn decode_boxed<C: 'static, M: Handle<C>>(r: &mut WireReader<'_>) -> Result<BoxedHandler<C>, ProtocolError> {
    Ok(Box::new(M::decode(r)?))
}

struct Entry<C> {
    name: &'static str,
    decode: DecodeFn<C>,
}

impl<C> Clone for Entry<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            decode: self.decode,
        }
    }
}

/// A named group of message registrations, added as a unit.
pub struct MessagePackage<C> {
    /// Unique package name; adding the same package twice is a no-op.
    pub name: &'static str,
    /// Registers every message of the package.
    pub register: fn(&mut MessageRegistry<C>) -> Result<(), ProtocolError>,
}

impl<C> Clone for MessagePackage<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            register: self.register,
        }
    }
}

impl<C> fmt::Debug for MessagePackage<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePackage").field("name", &self.name).finish()
    }
}

/// Lookup table from [`MessageId`] to a decoder producing a handler.
pub struct MessageRegistry<C> {
    entries: HashMap<MessageId, Entry<C>>,
    packages: Vec<&'static str>,
}

impl<C> Clone for MessageRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            packages: self.packages.clone(),
        }
    }
}

impl<C> Default for MessageRegistry<C> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            packages: Vec::new(),
        }
    }
}

impl<C> fmt::Debug for MessageRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort();
        f.debug_struct("MessageRegistry")
            .field("packages", &self.packages)
            .field("messages", &ids)
            .finish()
    }
}

impl<C: 'static> MessageRegistry<C> {
    /// An empty registry (system messages are always understood).
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers message type `M`.
    ///
    /// # Errors
    /// - [`ProtocolError::ReservedCategory`] if `M` claims category 0.
    /// - [`ProtocolError::DuplicateRegistration`] if the pair is taken.
    pub fn register<M: Handle<C>>(&mut self) -> Result<&mut Self, ProtocolError> {
        let id = M::id();
        if id.category == SYSTEM_CATEGORY {
            return Err(ProtocolError::ReservedCategory(id.category));
        }
        if self.entries.contains_key(&id) {
            return Err(ProtocolError::DuplicateRegistration(id));
        }
        self.entries.insert(
            id,
            Entry {
                name: std::any::type_name::<M>(),
                decode: decode_boxed::<C, M>,
            },
        );
        tracing::trace!(%id, name = std::any::type_name::<M>(), "message registered");
        Ok(self)
    }

    /// Adds every message of `package`.
    ///
    /// Either the whole package is added or, on error, the registry is
    /// left unchanged.
    pub fn add_package(&mut self, package: &MessagePackage<C>) -> Result<(), ProtocolError> {
        if self.packages.contains(&package.name) {
            tracing::debug!(package = package.name, "package already loaded");
            return Ok(());
        }
        let mut staged = self.clone();
        (package.register)(&mut staged)?;
        staged.packages.push(package.name);
        tracing::debug!(
            package = package.name,
            messages = staged.entries.len() - self.entries.len(),
            "message package loaded"
        );
        *self = staged;
        Ok(())
    }

    /// Builder-style [`add_package`](Self::add_package).
    pub fn with_package(mut self, package: &MessagePackage<C>) -> Result<Self, ProtocolError> {
        self.add_package(package)?;
        Ok(self)
    }

    /// Returns a copy of this registry extended with `package`.
    ///
    /// The receiver is not modified, so connections already holding it
    /// keep their view.
    pub fn extended(&self, package: &MessagePackage<C>) -> Result<Self, ProtocolError> {
        self.clone().with_package(package)
    }

    /// Whether a handler is registered for `id`.
    pub fn contains(&self, id: MessageId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Type name registered for `id`, for diagnostics.
    pub fn name_of(&self, id: MessageId) -> Option<&'static str> {
        self.entries.get(&id).map(|e| e.name)
    }

    /// Decodes the payload of message `id`.
    ///
    /// `None` if nothing is registered for `id`.
    pub fn decode(
        &self,
        id: MessageId,
        r: &mut WireReader<'_>,
    ) -> Option<Result<BoxedHandler<C>, ProtocolError>> {
        self.entries.get(&id).map(|e| (e.decode)(r))
    }

    /// Names of loaded packages in load order.
    pub fn packages(&self) -> &[&'static str] {
        &self.packages
    }

    /// Number of registered message types.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::WireWriter;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Ctx {
        total: AtomicU32,
    }

    struct Add(u32);

    impl Message for Add {
        const CATEGORY: u8 = 5;
        const TYPE: u8 = 1;
        fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), ProtocolError> {
            w.put_u32(self.0);
            Ok(())
        }
        fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
            Ok(Self(r.get_u32()?))
        }
    }

    impl Handle<Ctx> for Add {
        fn handle(self, ctx: &Ctx) -> Result<Dispatch<Ctx>, HandlerError> {
            ctx.total.fetch_add(self.0, Ordering::SeqCst);
            Ok(Dispatch::Done)
        }
    }

    struct AddLater(u32);

    impl Message for AddLater {
        const CATEGORY: u8 = 5;
        const TYPE: u8 = 2;
        fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), ProtocolError> {
            w.put_u32(self.0);
            Ok(())
        }
        fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
            Ok(Self(r.get_u32()?))
        }
    }

    impl Handle<Ctx> for AddLater {
        fn handle(self, _ctx: &Ctx) -> Result<Dispatch<Ctx>, HandlerError> {
            let n = self.0;
            Ok(Dispatch::Defer(Deferred::new("add-later", move |c: &Ctx| {
                c.total.fetch_add(n, Ordering::SeqCst);
            })))
        }
    }

    struct Sneaky;

    impl Message for Sneaky {
        const CATEGORY: u8 = SYSTEM_CATEGORY;
        const TYPE: u8 = 99;
        fn encode(&self, _w: &mut WireWriter<'_>) -> Result<(), ProtocolError> {
            Ok(())
        }
        fn decode(_r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
            Ok(Self)
        }
    }

    impl Handle<Ctx> for Sneaky {
        fn handle(self, _ctx: &Ctx) -> Result<Dispatch<Ctx>, HandlerError> {
            Ok(Dispatch::Done)
        }
    }

    fn math(reg: &mut MessageRegistry<Ctx>) -> Result<(), ProtocolError> {
        reg.register::<Add>()?.register::<AddLater>()?;
        Ok(())
    }

    const MATH: MessagePackage<Ctx> = MessagePackage {
        name: "math",
        register: math,
    };

    // =====================================================================
    // Registration
    // =====================================================================

    #[test]
    fn test_register_duplicate_pair_fails() {
        let mut reg = MessageRegistry::<Ctx>::new();
        reg.register::<Add>().unwrap();
        let err = reg.register::<Add>().err().unwrap();
        assert!(matches!(err, ProtocolError::DuplicateRegistration(id) if id == Add::id()));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_register_system_category_rejected() {
        let mut reg = MessageRegistry::<Ctx>::new();
        assert!(matches!(
            reg.register::<Sneaky>().err().unwrap(),
            ProtocolError::ReservedCategory(0)
        ));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_add_package_is_idempotent() {
        let mut reg = MessageRegistry::new();
        reg.add_package(&MATH).unwrap();
        reg.add_package(&MATH).unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.packages(), &["math"]);
    }

    #[test]
    fn test_failed_package_leaves_registry_unchanged() {
        fn clashing(reg: &mut MessageRegistry<Ctx>) -> Result<(), ProtocolError> {
            reg.register::<AddLater>()?;
            reg.register::<Add>()?;
            Ok(())
        }
        let clash = MessagePackage {
            name: "clash",
            register: clashing,
        };

        let mut reg = MessageRegistry::new();
        reg.register::<Add>().unwrap();
        assert!(reg.add_package(&clash).is_err());
        assert_eq!(reg.len(), 1);
        assert!(!reg.contains(AddLater::id()));
        assert!(reg.packages().is_empty());
    }

    #[test]
    fn test_extended_does_not_touch_original() {
        let base = MessageRegistry::<Ctx>::new();
        let bigger = base.extended(&MATH).unwrap();
        assert!(base.is_empty());
        assert_eq!(bigger.len(), 2);
        assert!(bigger.name_of(Add::id()).unwrap().ends_with("Add"));
    }

    // =====================================================================
    // Decode + dispatch
    // =====================================================================

    #[test]
    fn test_decode_and_run_inline_handler() {
        let reg = MessageRegistry::new().with_package(&MATH).unwrap();
        let ctx = Ctx::default();

        let mut r = WireReader::new(&[0, 0, 0, 42]);
        let handler = reg.decode(Add::id(), &mut r).unwrap().unwrap();
        assert_eq!(handler.message_id(), Add::id());
        assert!(matches!(handler.run(&ctx).unwrap(), Dispatch::Done));
        assert_eq!(ctx.total.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_deferred_handler_does_not_apply_inline() {
        let reg = MessageRegistry::new().with_package(&MATH).unwrap();
        let ctx = Ctx::default();

        let mut r = WireReader::new(&[0, 0, 0, 5]);
        let handler = reg.decode(AddLater::id(), &mut r).unwrap().unwrap();
        let Dispatch::Defer(action) = handler.run(&ctx).unwrap() else {
            panic!("expected a deferred action");
        };
        assert_eq!(ctx.total.load(Ordering::SeqCst), 0);
        action.apply(&ctx);
        assert_eq!(ctx.total.load(Ordering::SeqCst), 5);
    }

    /// One message type per `(CAT, TY)`, counting its own hits.
    struct Tagged<const CAT: u8, const TY: u8>;

    #[derive(Default)]
    struct Tally {
        hits: std::sync::Mutex<HashMap<MessageId, u32>>,
    }

    impl<const CAT: u8, const TY: u8> Message for Tagged<CAT, TY> {
        const CATEGORY: u8 = CAT;
        const TYPE: u8 = TY;
        fn encode(&self, _w: &mut WireWriter<'_>) -> Result<(), ProtocolError> {
            Ok(())
        }
        fn decode(_r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
            Ok(Self)
        }
    }

    impl<const CAT: u8, const TY: u8> Handle<Tally> for Tagged<CAT, TY> {
        fn handle(self, ctx: &Tally) -> Result<Dispatch<Tally>, HandlerError> {
            *ctx.hits.lock().unwrap().entry(Self::id()).or_default() += 1;
            Ok(Dispatch::Done)
        }
    }

    #[test]
    fn test_each_registered_pair_runs_only_its_own_handler() {
        let mut reg = MessageRegistry::<Tally>::new();
        reg.register::<Tagged<1, 1>>()
            .unwrap()
            .register::<Tagged<1, 2>>()
            .unwrap()
            .register::<Tagged<2, 1>>()
            .unwrap()
            .register::<Tagged<7, 200>>()
            .unwrap()
            .register::<Tagged<255, 255>>()
            .unwrap();
        let ids = [
            MessageId::new(1, 1),
            MessageId::new(1, 2),
            MessageId::new(2, 1),
            MessageId::new(7, 200),
            MessageId::new(255, 255),
        ];
        assert_eq!(reg.len(), ids.len());

        let ctx = Tally::default();
        for (i, id) in ids.iter().enumerate() {
            let handler = reg.decode(*id, &mut WireReader::new(&[])).unwrap().unwrap();
            assert_eq!(handler.message_id(), *id);
            assert!(matches!(handler.run(&ctx).unwrap(), Dispatch::Done));

            let hits = ctx.hits.lock().unwrap();
            assert_eq!(hits.len(), i + 1, "only {id} may have run");
            assert!(hits.values().all(|&n| n == 1), "a handler ran twice");
            assert_eq!(hits.get(id), Some(&1));
        }
    }

    #[test]
    fn test_decode_unregistered_is_none() {
        let reg = MessageRegistry::<Ctx>::new();
        let mut r = WireReader::new(&[]);
        assert!(reg.decode(MessageId::new(5, 1), &mut r).is_none());
    }
}
