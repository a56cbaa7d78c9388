use crate::error::MuxError;
use crate::record::{SensorKind, SensorSample};

/// One line from the IMU: accelerometer then gyroscope, three axes each.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuReading {
    pub accel: [f64; 3],
    pub gyro: [f64; 3],
}

/// `-?digits.digits`, nothing else.
fn is_decimal(field: &str) -> bool {
    let unsigned = field.strip_prefix('-').unwrap_or(field);
    let Some((int, frac)) = unsigned.split_once('.') else {
        return false;
    };
    !int.is_empty()
        && !frac.is_empty()
        && int.bytes().all(|b| b.is_ascii_digit())
        && frac.bytes().all(|b| b.is_ascii_digit())
}

impl ImuReading {
    /// Parses `ax,ay,az,gx,gy,gz`. Surrounding whitespace is ignored.
    pub fn parse_line(line: &str) -> Result<Self, MuxError> {
        let line = line.trim();
        let malformed = || MuxError::MalformedRecord(line.to_string());

        let mut values = [0.0f64; 6];
        let mut count = 0;
        for field in line.split(',') {
            if count == values.len() || !is_decimal(field) {
                return Err(malformed());
            }
            values[count] = field.parse().map_err(|_| malformed())?;
            count += 1;
        }
        if count != values.len() {
            return Err(malformed());
        }

        Ok(Self {
            accel: [values[0], values[1], values[2]],
            gyro: [values[3], values[4], values[5]],
        })
    }

    pub fn accel_sample(&self) -> SensorSample {
        let [x, y, z] = self.accel;
        SensorSample::new(SensorKind::Accel, x, y, z)
    }

    pub fn gyro_sample(&self) -> SensorSample {
        let [x, y, z] = self.gyro;
        SensorSample::new(SensorKind::Gyro, x, y, z)
    }

    /// Both samples, accelerometer first.
    pub fn samples(&self) -> [SensorSample; 2] {
        [self.accel_sample(), self.gyro_sample()]
    }
}
