//! `krati-core`: a segmented append-only data log paired with a
//! redo-logged, watermark-recovered address array, addressed purely by
//! integer index. See `store` for the component breakdown.

mod store;

pub use store::{
    Address, Mode, Result, SegmentFactoryKind, Store, StoreConfig, StoreError, StoreStats,
};
