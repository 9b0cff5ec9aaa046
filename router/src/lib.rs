//! Ordered regex routing for gale.
//!
//! A [Router] owns an ordered list of [rules](Rule); lookup walks the rules
//! in insertion order and the first one whose host pattern, path pattern and
//! method set all match wins. A rule may target a nested router, in which
//! case its path pattern matches a prefix and the remainder is routed by the
//! nested rules.

#![forbid(unsafe_code)]

mod params;
mod router;

pub use self::{
    params::{Params, ParamsIter},
    router::{InsertError, Match, Router, Rule},
};
