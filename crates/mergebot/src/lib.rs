//! vidmerge: the Telegram front end of the video merger.
//!
//! Everything that does not need a Bot API connection lives in `mergecore`;
//! this crate wires it to teloxide.

pub mod cli;
pub mod telegram;
