use num_complex::Complex;

/// Raw sample as it comes off the wire
pub type ComplexSample = Complex<i16>;

/// Precision used for covariance accumulation
pub type ComplexAcc = Complex<f64>;

pub fn widen(sample: ComplexSample) -> ComplexAcc {
    Complex::new(sample.re as f64, sample.im as f64)
}
