//! What a mutator's return value means for notification.

/// Return value of a mutator that may opt out of notifying subscribers.
///
/// `Cancel` does not undo anything the mutator already did. It only
/// suppresses the broadcast for this invocation; the caller still receives
/// the carried payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[must_use = "returning `Outcome` from a mutator is what suppresses or allows notification"]
pub enum Outcome<P> {
    /// Notify subscribers if the state changed.
    Commit(P),
    /// Skip notification for this invocation.
    Cancel(P),
}

/// Build a cancellation signal carrying `payload`.
///
/// ```ignore
/// store.act(|todos| {
///     if todos.is_locked() {
///         return bindstate::cancel(false);
///     }
///     todos.clear();
///     Outcome::Commit(true)
/// });
/// ```
pub fn cancel<P>(payload: P) -> Outcome<P> {
    Outcome::Cancel(payload)
}

impl<P> Outcome<P> {
    /// True for [`Outcome::Cancel`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancel(_))
    }

    /// The carried payload, whichever the variant.
    pub fn into_inner(self) -> P {
        match self {
            Outcome::Commit(payload) | Outcome::Cancel(payload) => payload,
        }
    }
}

/// Classifies a mutator's return value into the value handed back to the
/// caller and whether change detection should run for it.
///
/// - [`Outcome`] hands back its payload and proceeds only on `Commit`.
/// - `Result` is handed back unchanged and proceeds only on `Ok`; an `Err`
///   is a failed mutation and never broadcasts.
/// - `()` and plain scalar values always proceed and are handed back as is.
///
/// Any other return type is wrapped in [`Outcome::Commit`] by the mutator.
pub trait Settle {
    /// What the caller receives.
    type Output;

    /// Split into the caller's value and the proceed flag.
    fn settle(self) -> (Self::Output, bool);

    /// True for a failed mutation, as opposed to a cancelled one.
    fn failed(&self) -> bool {
        false
    }
}

impl<P> Settle for Outcome<P> {
    type Output = P;

    fn settle(self) -> (P, bool) {
        match self {
            Outcome::Commit(payload) => (payload, true),
            Outcome::Cancel(payload) => (payload, false),
        }
    }
}

impl<T, E> Settle for Result<T, E> {
    type Output = Result<T, E>;

    fn settle(self) -> (Self::Output, bool) {
        let proceed = self.is_ok();
        (self, proceed)
    }

    fn failed(&self) -> bool {
        self.is_err()
    }
}

macro_rules! always_commit {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Settle for $ty {
                type Output = $ty;

                #[inline]
                fn settle(self) -> ($ty, bool) {
                    (self, true)
                }
            }
        )+
    };
}

always_commit!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    &'static str,
);
