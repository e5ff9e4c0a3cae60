extern crate aes;
extern crate byteorder;
extern crate chrono;
#[cfg(feature = "kms-srv")]
extern crate clap;
#[cfg(feature = "kms-srv")]
extern crate hex;
extern crate hmac;
extern crate indexmap;
extern crate log;
extern crate num_enum;
extern crate rand;
extern crate sha2;
#[cfg(feature = "kms-srv")]
extern crate stderrlog;
extern crate uuid;

#[macro_use]
pub mod model;
pub mod core;
