use crate::error::ValidationError;
use crate::mapping::Reading;

const PERCENT: (f64, f64) = (0.0, 100.0);

/// Physical-plausibility checks. Out-of-range values are rejected, never clamped.
pub fn validate(reading: &Reading) -> Result<(), ValidationError> {
    if reading.device_id.trim().is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }
    let moisture = reading.moisture.ok_or(ValidationError::MissingMoisture)?;
    check_range("moisture", Some(moisture), PERCENT)?;
    check_range("humidity", reading.humidity, PERCENT)?;
    check_range("battery", reading.battery, PERCENT)?;
    Ok(())
}

fn check_range(
    field: &'static str,
    value: Option<f64>,
    (min, max): (f64, f64),
) -> Result<(), ValidationError> {
    match value {
        Some(v) if !(min..=max).contains(&v) => Err(ValidationError::OutOfRange {
            field,
            value: v,
            min,
            max,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reading(moisture: Option<f64>) -> Reading {
        Reading {
            device_id: "sensor_01".into(),
            timestamp: Utc::now(),
            moisture,
            temperature: Some(-12.0),
            humidity: None,
            battery: None,
            raw_payload: "{}".into(),
        }
    }

    #[test]
    fn test_accepts_bounds() {
        for m in [0.0, 45.2, 100.0] {
            assert_eq!(validate(&reading(Some(m))), Ok(()));
        }
        let r = Reading {
            humidity: Some(100.0),
            battery: Some(0.0),
            ..reading(Some(50.0))
        };
        assert_eq!(validate(&r), Ok(()));
    }

    #[test]
    fn test_negative_moisture() {
        assert!(matches!(
            validate(&reading(Some(-5.0))),
            Err(ValidationError::OutOfRange { field: "moisture", .. })
        ));
    }

    #[test]
    fn test_humidity_over_range() {
        let r = Reading {
            humidity: Some(150.0),
            ..reading(Some(45.2))
        };
        assert_eq!(
            validate(&r),
            Err(ValidationError::OutOfRange {
                field: "humidity",
                value: 150.0,
                min: 0.0,
                max: 100.0
            })
        );
    }

    #[test]
    fn test_battery_over_range() {
        let r = Reading {
            battery: Some(100.5),
            ..reading(Some(45.2))
        };
        assert!(matches!(
            validate(&r),
            Err(ValidationError::OutOfRange { field: "battery", .. })
        ));
    }

    #[test]
    fn test_required_fields() {
        assert_eq!(validate(&reading(None)), Err(ValidationError::MissingMoisture));
        let r = Reading {
            device_id: String::new(),
            ..reading(Some(10.0))
        };
        assert_eq!(validate(&r), Err(ValidationError::EmptyDeviceId));
    }

    #[test]
    fn test_temperature_is_unbounded() {
        let r = Reading {
            temperature: Some(-80.0),
            ..reading(Some(10.0))
        };
        assert_eq!(validate(&r), Ok(()));
    }
}
