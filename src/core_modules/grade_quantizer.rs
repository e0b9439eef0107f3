// THEORY:
// The grade quantizer is the last, and the simplest, stage of the grading
// pipeline. It snaps a continuous weighted-average grade onto the fixed,
// ordered grade-point list that collectors recognise.
//
// It always rounds toward the lower grade. A grade reported to a buyer must
// never be better than what the evidence supports, so a 9.79 is a 9.6 and not
// a 9.8. Values outside the scale are clamped first, and a value that already
// sits on the scale is returned unchanged.

pub mod grade_quantizer {
    /// The grading scale, best first.
    pub const GRADE_SCALE: [f64; 24] = [
        10.0, 9.8, 9.6, 9.4, 9.2, 9.0, 8.5, 8.0, 7.5, 7.0, 6.5, 6.0, 5.5, 5.0, 4.5, 4.0, 3.5, 3.0, 2.5, 2.0, 1.8,
        1.5, 1.0, 0.5,
    ];

    pub const MAX_GRADE: f64 = 10.0;
    pub const MIN_GRADE: f64 = 0.5;

    /// Tolerance for values that are on the scale up to floating-point noise
    /// (a weighted average of 9.8s can come out as 9.799999999999999).
    const ON_SCALE_EPSILON: f64 = 1e-9;

    /// The greatest grade point that is `<=` the clamped input.
    pub fn quantize_grade(grade: f64) -> f64 {
        if grade.is_nan() {
            return MIN_GRADE;
        }
        let clamped = grade.clamp(MIN_GRADE, MAX_GRADE);
        GRADE_SCALE
            .iter()
            .copied()
            .find(|&point| point <= clamped + ON_SCALE_EPSILON)
            .unwrap_or(MIN_GRADE)
    }

    pub fn is_on_scale(grade: f64) -> bool {
        GRADE_SCALE.iter().any(|&point| (point - grade).abs() < ON_SCALE_EPSILON)
    }
}
