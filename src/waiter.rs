use crate::clause::Clause;

/// A single `(fd, direction)` waiter slot.
///
/// Invariant 4.1.1 ("at most one clause per (fd, direction)") lets each
/// direction collapse to `Option<Waiter>` instead of an intrusive list
/// (spec Design Note 9, option (c)): there is never more than one element
/// to link.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Waiter {
    pub(crate) clause: Clause,
    pub(crate) id: i32,
}
