//! Linear resampling from the recording rate onto the SV output rate.

/// Linear interpolation at fractional index `t`, clamping at both ends:
/// `t <= 0` yields the first sample and `t >= n-1` the last.
pub fn linear_interp(data: &[f64], t: f64) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let last = data.len() - 1;
    if t <= 0.0 {
        return data[0];
    }
    if t >= last as f64 {
        return data[last];
    }
    let i0 = t.floor() as usize;
    let frac = t - i0 as f64;
    data[i0] * (1.0 - frac) + data[i0 + 1] * frac
}

/// Resample every channel from `in_rate` to `out_rate`. Each output channel
/// has `ceil(n_in * out_rate / in_rate)` samples. Rates within 0.1 Hz of
/// each other pass the input through unchanged.
pub fn resample(channels: &[Vec<f64>], in_rate: f64, out_rate: f64) -> Vec<Vec<f64>> {
    if (in_rate - out_rate).abs() <= 0.1 {
        return channels.to_vec();
    }
    if channels.is_empty() || channels[0].is_empty() {
        return channels.to_vec();
    }

    let n_in = channels[0].len();
    let n_out = (n_in as f64 * out_rate / in_rate).ceil() as usize;
    let step = in_rate / out_rate;

    channels
        .iter()
        .map(|channel| (0..n_out).map(|j| linear_interp(channel, j as f64 * step)).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interp_exact_at_integer_indices() {
        let data = vec![5.0, -3.0, 12.0, 0.5];
        for (k, expected) in data.iter().enumerate() {
            assert_eq!(linear_interp(&data, k as f64), *expected);
        }
    }

    #[test]
    fn test_interp_midpoints() {
        let data = vec![0.0, 10.0, 20.0];
        assert_eq!(linear_interp(&data, 0.5), 5.0);
        assert_eq!(linear_interp(&data, 1.25), 12.5);
    }

    #[test]
    fn test_interp_clamps_boundaries() {
        let data = vec![1.0, 2.0, 3.0];
        assert_eq!(linear_interp(&data, -4.0), 1.0);
        assert_eq!(linear_interp(&data, 2.0), 3.0);
        assert_eq!(linear_interp(&data, 99.0), 3.0);
        assert_eq!(linear_interp(&[], 0.0), 0.0);
    }

    #[test]
    fn test_upsample_960_to_4800() {
        let input = vec![(0..10).map(f64::from).collect::<Vec<f64>>()];
        let output = resample(&input, 960.0, 4800.0);
        assert_eq!(output[0].len(), 50);
        // Output index 4 maps to t = 4 * 960 / 4800 = 0.8.
        assert!((output[0][4] - 0.8).abs() < 1e-12);
        assert_eq!(output[0][0], 0.0);
        assert_eq!(output[0][5], 1.0);
        // Tail clamps to the last input sample.
        assert_eq!(output[0][49], 9.0);
    }

    #[test]
    fn test_downsample_length() {
        let input = vec![vec![0.0; 100], vec![1.0; 100]];
        let output = resample(&input, 9600.0, 4800.0);
        assert_eq!(output.len(), 2);
        assert_eq!(output[0].len(), 50);
        assert_eq!(output[1].len(), 50);
        assert!(output[1].iter().all(|v| *v == 1.0));
    }

    #[test]
    fn test_all_channels_same_length() {
        let input = vec![vec![0.0; 33]; 8];
        let output = resample(&input, 1000.0, 4800.0);
        let expected = (33.0f64 * 4.8).ceil() as usize;
        for channel in &output {
            assert_eq!(channel.len(), expected);
        }
    }

    #[test]
    fn test_equal_rates_pass_through() {
        let input = vec![vec![1.0, 2.0, 3.0]];
        let output = resample(&input, 4800.0, 4800.05);
        assert_eq!(output, input);
    }
}
