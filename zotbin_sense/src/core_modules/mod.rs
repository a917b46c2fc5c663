// Weight path: pins, ADC driver, sampling, calibration, engine.
pub mod gpio;
pub mod hx711;
pub mod sampler;
pub mod calibration;
pub mod scale;

// Vision path: frames in, one representative frame out.
pub mod clock;
pub mod camera;
#[cfg(feature = "live-camera")]
pub mod device_camera;
pub mod frame_ops;
pub mod regions;
pub mod background;
pub mod presence;
pub mod transit;
pub mod selection;
pub mod capture;
