//! Core of a partitioned parameter-server runtime: a message-driven
//! coordination fabric that lets worker partitions train against parameter
//! shards held by server partitions, with pluggable storage logic, worker
//! logic, routing codecs and an optional model preload.

#[macro_use]
mod error;
pub use error::{AnyError, AnyResult, FabricError};

pub mod codec;
pub mod config;
pub mod logic;
pub mod message;
pub mod partition;
pub mod store;

mod runtime;
mod transform;

pub use runtime::JobHandle;
pub use transform::{
    transform, transform_custom, transform_with_default_ps, transform_with_double_model_load,
    transform_with_model_load, Routing, SimpleRouting,
};

use figlet_rs::FIGfont;

pub fn print_logo() {
    let standard_font = FIGfont::standard().unwrap();
    if let Some(figure) = standard_font.convert("Paramflow") {
        println!("{}", figure);
    }
}
