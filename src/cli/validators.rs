use primal::is_prime;

use std::ops::RangeInclusive;
use std::time::Duration;

const SAMPLE_FREQ_RANGE: RangeInclusive<u64> = 1..=1009;
/// perf refuses larger DWARF stack dumps.
const MAX_DWARF_STACK_SIZE: u32 = 65528;

pub(crate) fn parse_duration(arg: &str) -> Result<Duration, std::num::ParseIntError> {
    let seconds = arg.parse()?;
    Ok(Duration::from_secs(seconds))
}

pub(crate) fn sample_freq_in_range(s: &str) -> Result<u64, String> {
    let sample_freq: u64 = s
        .parse()
        .map_err(|_| format!("`{s}' isn't a valid frequency"))?;
    if !SAMPLE_FREQ_RANGE.contains(&sample_freq) {
        return Err(format!(
            "sample frequency not in allowed range {}-{}",
            SAMPLE_FREQ_RANGE.start(),
            SAMPLE_FREQ_RANGE.end()
        ));
    }
    if !is_prime(sample_freq) {
        let (prime_before, prime_after) = primes_before_after(sample_freq as usize)?;
        return Err(format!(
            "Sample frequency {} is not prime - use {} (before) or {} (after) instead",
            sample_freq, prime_before, prime_after
        ));
    }
    Ok(sample_freq)
}

pub(crate) fn dwarf_stack_size_in_range(s: &str) -> Result<u32, String> {
    let size: u32 = s
        .parse()
        .map_err(|_| format!("`{s}' isn't a valid stack size"))?;
    if size == 0 || size > MAX_DWARF_STACK_SIZE {
        return Err(format!(
            "DWARF stack size must be between 1 and {}",
            MAX_DWARF_STACK_SIZE
        ));
    }
    Ok(size)
}

/// Given a non-prime unsigned int, return the prime number that precedes it
/// as well as the prime that succeeds it
fn primes_before_after(non_prime: usize) -> Result<(usize, usize), String> {
    if is_prime(non_prime as u64) {
        return Err(format!("{} is prime", non_prime));
    }
    // What is the count (not value) of the prime just before our non_prime?
    let n_before = primal::StreamingSieve::prime_pi(non_prime);
    if n_before == 0 {
        return Err(format!("there is no prime before {}", non_prime));
    }
    let before = primal::StreamingSieve::nth_prime(n_before);
    let after = primal::StreamingSieve::nth_prime(n_before + 1);
    Ok((before, after))
}
