pub mod fft;
pub mod frc;
pub mod rings;
