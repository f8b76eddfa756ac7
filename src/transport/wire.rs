//! Push-channel wire format.
//!
//! One ASCII line per point: `point_index,frequency_hz,real,imag`. There is no
//! end-of-sweep marker; sweep completeness is inferred from the point count.

use crate::error::{VnaError, VnaResult};
use crate::measurement::{PointMessage, PortId};
use num_complex::Complex32;

/// Decode one line received on `port`'s push channel.
pub fn decode_point(port: &PortId, line: &str) -> VnaResult<PointMessage> {
    let violation = |reason: String| VnaError::ProtocolViolation {
        port: port.to_string(),
        reason,
    };

    let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
    if fields.len() != 4 {
        return Err(violation(format!(
            "expected 4 fields, got {} in {:?}",
            fields.len(),
            line
        )));
    }

    let point_index = fields[0]
        .parse::<usize>()
        .map_err(|_| violation(format!("bad point index {:?}", fields[0])))?;
    let frequency_hz = fields[1]
        .parse::<u64>()
        .map_err(|_| violation(format!("bad frequency {:?}", fields[1])))?;
    let re = fields[2]
        .parse::<f32>()
        .map_err(|_| violation(format!("bad real part {:?}", fields[2])))?;
    let im = fields[3]
        .parse::<f32>()
        .map_err(|_| violation(format!("bad imaginary part {:?}", fields[3])))?;

    if !re.is_finite() || !im.is_finite() {
        return Err(violation(format!("non-finite value in {:?}", line)));
    }

    Ok(PointMessage {
        port: port.clone(),
        point_index,
        frequency_hz,
        s_parameter: Complex32::new(re, im),
    })
}

/// Encode a point as one wire line, newline included.
pub fn encode_point(point_index: usize, frequency_hz: u64, value: Complex32) -> String {
    format!("{},{},{:.7e},{:.7e}\n", point_index, frequency_hz, value.re, value.im)
}
