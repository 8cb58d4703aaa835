//! Macros shared by the peerpool crates.

#[macro_export]
/// Implements `From<$from_thing>` for `$thing` by wrapping the value in `$thing::$field`, so
/// errors from lower layers can be bubbled up with `?`.
///
/// ```rust
/// # use peerpool_common::impl_error_from;
/// enum PeerError {
///     Io(std::io::Error),
///     Port(std::num::ParseIntError),
/// }
///
/// impl_error_from!(PeerError, std::io::Error, Io);
/// impl_error_from!(PeerError, std::num::ParseIntError, Port);
///
/// fn parse_port(s: &str) -> Result<u16, PeerError> {
///     Ok(s.parse()?)
/// }
/// ```
macro_rules! impl_error_from {
    ($thing:ty, $from_thing:ty, $field:ident) => {
        impl From<$from_thing> for $thing {
            fn from(e: $from_thing) -> Self {
                <$thing>::$field(e)
            }
        }
    };
}

#[macro_export]
/// Panics unless the expression is `Ok(_)`, printing the error otherwise.
///
/// ```rust
/// # use peerpool_common::assert_ok;
/// assert_ok!(Ok::<u16, &str>(8333));
/// ```
///
/// ```rust,should_panic
/// # use peerpool_common::assert_ok;
/// assert_ok!(Err::<u16, &str>("connection refused"));
/// ```
macro_rules! assert_ok {
    ($expr:expr $(,)?) => {
        if let Err(e) = $expr {
            panic!("assertion failed: expected `Ok(_)`, got `Err({:?})`", e);
        }
    };
}

#[macro_export]
/// Panics unless the expression is `Err(_)`, printing the value otherwise.
///
/// ```rust
/// # use peerpool_common::assert_err;
/// assert_err!(Err::<u16, &str>("connection refused"));
/// ```
macro_rules! assert_err {
    ($expr:expr $(,)?) => {
        if let Ok(v) = $expr {
            panic!("assertion failed: expected `Err(_)`, got `Ok({:?})`", v);
        }
    };
}
