pub use crate::architect::Architect;
pub use crate::component::{
    Component, ComponentRegistry, ComponentRunner, ComponentState, DataSink, DataSource,
    LifecycleEvent,
};
pub use crate::error::MatrixError;
pub use crate::io::Fifo;
pub use crate::keymaster::{Keymaster, KeymasterCallback, KeymasterServer};
pub use crate::transport::{
    DataCallback, TransportClient, TransportRegistry, TransportServer,
};
pub use crate::tree::TreeResult;
pub use crate::utils::CancelToken;
