// Speed arithmetic for a differential-drive base
// A speed is one wheel's signed throttle; the sign is the rotation direction.

/// Signed wheel speed, always within [-MAX_SPEED, MAX_SPEED]
pub type Speed = i16;

/// Largest magnitude the motor driver accepts
pub const MAX_SPEED: Speed = 255;

/// Saturate an arbitrary value into the valid speed range (never wraps)
pub fn clamp_speed(value: i32) -> Speed {
    value.clamp(-(MAX_SPEED as i32), MAX_SPEED as i32) as Speed
}

/// Both wheels set to the truncating mean of the two speeds ("straighten course")
pub fn equalize_speeds(a: Speed, b: Speed) -> (Speed, Speed) {
    let mean = clamp_speed((a as i32 + b as i32) / 2);
    (mean, mean)
}

/// Every value from `a` to `b`, both ends included, stepping by `step`
///
/// Descends when `a > b`. The last element is always `b`: if the stride
/// would jump past it, `b` is appended. A zero step is treated as 1.
pub fn range_incl(a: i32, b: i32, step: u32) -> Vec<i32> {
    let step = step.max(1) as i32;
    let stride = if a <= b { step } else { -step };

    let mut values = Vec::with_capacity(((b - a).unsigned_abs() / step as u32) as usize + 2);
    let mut current = a;
    while (stride > 0 && current < b) || (stride < 0 && current > b) {
        values.push(current);
        current += stride;
    }
    values.push(b);
    values
}
