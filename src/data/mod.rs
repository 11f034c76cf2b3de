//! Measurement file output.

pub mod storage;

pub use storage::{
    free_file_name, grid_file_name, GridParameters, RecordHeader, RecordLayout, RecordWriter,
    SensorParameters,
};
