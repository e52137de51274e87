//! Lifecycle scenarios driven through fake providers and trust stores.

mod scenarios;
mod test_doubles;
mod test_helpers;
