//! Wire-level pieces: request head parsing, body decoding, response
//! encoding.

pub(crate) mod decode;
pub(crate) mod encode;
pub(crate) mod parse;

pub(crate) use self::decode::{BodyFrame, Decoder, Progress};
pub(crate) use self::encode::Encoder;
pub(crate) use self::parse::{BodyFraming, ParseLimits, RequestHead, UpgradeRequest};
