//! Connection table owned by the IO stage.
//!
//! Indexed by `Token`. A slot whose context is out on the queues stays
//! reserved (`Lent`) so its token cannot be reused until the context comes
//! back or the table is dropped.

use handoff_core::Token;

use crate::context::ConnectionContext;

enum Slot {
    Vacant,
    Held(Box<ConnectionContext>),
    Lent,
}

#[derive(Default)]
pub struct ConnTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
    lent: usize,
}

impl ConnTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a token and store the context built for it.
    pub fn insert_with<F>(&mut self, make: F) -> Token
    where
        F: FnOnce(Token) -> Box<ConnectionContext>,
    {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot::Vacant);
                self.slots.len() - 1
            }
        };
        let token = Token(idx);
        self.slots[idx] = Slot::Held(make(token));
        token
    }

    pub fn get(&self, token: Token) -> Option<&ConnectionContext> {
        match self.slots.get(token.0)? {
            Slot::Held(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut ConnectionContext> {
        match self.slots.get_mut(token.0)? {
            Slot::Held(ctx) => Some(ctx),
            _ => None,
        }
    }

    /// Take the context out for a hand-off; the slot stays reserved.
    pub fn lend(&mut self, token: Token) -> Option<Box<ConnectionContext>> {
        let slot = self.slots.get_mut(token.0)?;
        if !matches!(slot, Slot::Held(_)) {
            return None;
        }
        self.lent += 1;
        match std::mem::replace(slot, Slot::Lent) {
            Slot::Held(ctx) => Some(ctx),
            _ => None,
        }
    }

    /// Put a lent context back in its slot.
    pub fn restore(&mut self, ctx: Box<ConnectionContext>) {
        let idx = ctx.token().0;
        debug_assert!(
            matches!(self.slots.get(idx), Some(Slot::Lent)),
            "restoring token {} that was not lent",
            idx
        );
        if matches!(self.slots[idx], Slot::Lent) {
            self.lent -= 1;
        }
        self.slots[idx] = Slot::Held(ctx);
    }

    /// Release the slot and hand back its context for teardown.
    pub fn remove(&mut self, token: Token) -> Option<Box<ConnectionContext>> {
        let slot = self.slots.get_mut(token.0)?;
        match std::mem::replace(slot, Slot::Vacant) {
            Slot::Held(ctx) => {
                self.free.push(token.0);
                Some(ctx)
            }
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Connections alive, including those out on the queues.
    pub fn active(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn lent(&self) -> usize {
        self.lent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_util::loopback_pair;

    #[test]
    fn test_insert_lend_restore_remove() {
        let mut table = ConnTable::new();
        let mut clients = Vec::new();
        let mut make = |token| {
            let (ctx, client) = loopback_pair(token);
            clients.push(client);
            ctx
        };

        let a = table.insert_with(&mut make);
        let b = table.insert_with(&mut make);
        assert_ne!(a, b);
        assert_eq!(table.active(), 2);

        let ctx = table.lend(a).unwrap();
        assert_eq!(ctx.token(), a);
        assert_eq!(table.lent(), 1);
        assert!(table.get_mut(a).is_none());
        assert!(table.lend(a).is_none());
        assert!(table.remove(a).is_none(), "lent slot must not be freed");

        table.restore(ctx);
        assert_eq!(table.lent(), 0);
        assert!(table.get_mut(a).is_some());

        assert!(table.remove(a).is_some());
        assert_eq!(table.active(), 1);
        assert!(table.remove(a).is_none());

        // Freed token is reused.
        let c = table.insert_with(&mut make);
        assert_eq!(c, a);
    }

    #[test]
    fn test_lent_token_not_reused() {
        let mut table = ConnTable::new();
        let mut clients = Vec::new();
        let mut make = |token| {
            let (ctx, client) = loopback_pair(token);
            clients.push(client);
            ctx
        };

        let a = table.insert_with(&mut make);
        let _ctx = table.lend(a).unwrap();
        let b = table.insert_with(&mut make);
        assert_ne!(a, b);
        assert_eq!(table.active(), 2);
    }
}
