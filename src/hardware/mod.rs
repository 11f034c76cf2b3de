//! Motion hardware of the bench: GPIO lines, stepper pulse generation and
//! the homed Z axis.

pub mod gpio;
pub mod mock;
pub mod stepper;
pub mod z_axis;

pub use gpio::{BenchLines, InputLine, MotorLines, OutputLine};
pub use stepper::{Direction, MotorProfile, StepperDriver};
pub use z_axis::{ZAxis, ZAxisSettings};
