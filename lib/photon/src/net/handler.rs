use crate::net::support::{
    AuxGetter, AuxHandler, AuxOutcome, ErrorType, Frame, PrimaryHandler, TransportResult,
};
use indexmap::IndexMap;
use rand::Rng;
use std::sync::{Arc, Mutex};

pub type HandlerKey = u32;

pub(crate) struct AuxEntry {
    pub handler: AuxHandler,
    pub getter: AuxGetter,
}

pub(crate) struct HandlerEntry {
    pub primary: PrimaryHandler,
    pub auxiliaries: Vec<AuxEntry>,
}

/// Keyed collection of packet handlers. Primaries are dispatched in
/// installation order; each primary carries its own ordered auxiliary chain.
/// Handlers persist until the registry is dropped.
pub struct HandlerRegistry {
    handlers: IndexMap<HandlerKey, HandlerEntry>,
}

impl HandlerRegistry {
    #[inline]
    pub fn new() -> HandlerRegistry {
        HandlerRegistry {
            handlers: IndexMap::new(),
        }
    }

    /// Installs a primary handler under a fresh uniformly random non-zero
    /// key and returns the key.
    pub fn install_primary(&mut self, primary: PrimaryHandler) -> HandlerKey {
        let mut rng = rand::thread_rng();

        loop {
            let key: HandlerKey = rng.gen();

            if key != 0 && !self.handlers.contains_key(&key) {
                self.handlers.insert(
                    key,
                    HandlerEntry {
                        primary,
                        auxiliaries: Vec::new(),
                    },
                );
                return key;
            }
        }
    }

    /// Appends an auxiliary handler/getter pair to the primary identified by
    /// `key`. Auxiliaries run in installation order.
    pub fn install_auxiliary(
        &mut self,
        key: HandlerKey,
        handler: AuxHandler,
        getter: AuxGetter,
    ) -> TransportResult<()> {
        let entry = self
            .handlers
            .get_mut(&key)
            .ok_or(ErrorType::InvalidValue)?;

        entry.auxiliaries.push(AuxEntry { handler, getter });
        Ok(())
    }

    /// Context-pointer flavor of `install_auxiliary`: plain functions plus a
    /// state value shared between the handler and the getter.
    pub fn install_auxiliary_ctx<C>(
        &mut self,
        key: HandlerKey,
        ctx: C,
        handler: fn(&mut C, i32, &mut Option<Frame>) -> Result<AuxOutcome, ErrorType>,
        getter: fn(&mut C, &mut Option<Frame>) -> Result<AuxOutcome, ErrorType>,
    ) -> TransportResult<()>
    where
        C: Send + 'static,
    {
        let handler_ctx = Arc::new(Mutex::new(ctx));
        let getter_ctx = handler_ctx.clone();

        self.install_auxiliary(
            key,
            Box::new(move |flags, frame| {
                let mut ctx = handler_ctx.lock().expect("Handler context poisoned");
                handler(&mut ctx, flags, frame)
            }),
            Box::new(move |frame| {
                let mut ctx = getter_ctx.lock().expect("Handler context poisoned");
                getter(&mut ctx, frame)
            }),
        )
    }

    /// Number of installed primaries.
    #[inline]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[inline]
    pub(crate) fn entries_mut(
        &mut self,
    ) -> impl Iterator<Item = (&HandlerKey, &mut HandlerEntry)> {
        self.handlers.iter_mut()
    }
}
