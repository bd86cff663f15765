//! Simulated analyzer data.
//!
//! [`DataGenerator`] owns the random source of one device and produces
//! everything that device needs to look like real hardware: status codes,
//! barcodes, lipemic readings, checksum tokens and loop delays. Seeding it
//! makes a device's output reproducible.

use std::ops::Range;
use std::time::Duration;

use chrono::NaiveDateTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::protocol::{
    Barcodes, DeviceStatus, DonationMessage, FormatVariant, LipemicReading, StatusMessage,
};

/// Fixed prefix of the REF barcode.
pub const REFERENCE_PREFIX: &str = "4KA";

/// Fixed prefix of the donation-ID barcode.
pub const DONATION_ID_PREFIX: &str = "0406059980";

/// Fixed prefix of the LOT barcode.
pub const LOT_PREFIX: &str = "00";

/// Fixed suffix of the LOT barcode.
pub const LOT_SUFFIX: &str = "KA";

/// Range of simulated lipemic measurements.
pub const LIPEMIC_RANGE: Range<u32> = 100..3500;

const REFERENCE_RANGE: Range<u32> = 1_000_000..9_999_999;
const DONATION_ID_RANGE: Range<u32> = 1000..9999;
const OPERATOR_ID_RANGE: Range<u32> = 1000..9999;
const LOT_RANGE: Range<u32> = 100_000..999_999;
const STATUS_CHECKSUM_RANGE: Range<u32> = 1000..9999;
const DONATION_CHECKSUM_RANGE: Range<u32> = 1..255;

/// Random source for one simulated device.
#[derive(Debug, Clone)]
pub struct DataGenerator {
    rng: StdRng,
}

impl DataGenerator {
    /// Wrap an existing random number generator.
    pub fn new(rng: StdRng) -> Self {
        Self { rng }
    }

    /// Create a reproducible generator.
    pub fn from_seed(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }

    /// Create a generator seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }

    /// Pick an operational state uniformly.
    pub fn device_status(&mut self) -> DeviceStatus {
        let statuses = DeviceStatus::all();
        statuses[self.rng.gen_range(0..statuses.len())]
    }

    /// Pick a donation layout uniformly.
    pub fn format_variant(&mut self) -> FormatVariant {
        let variants = FormatVariant::all();
        variants[self.rng.gen_range(0..variants.len())]
    }

    /// Generate a full set of barcodes; the variant decides which are sent.
    pub fn barcodes(&mut self) -> Barcodes {
        Barcodes {
            reference: format!(
                "{}{:07}",
                REFERENCE_PREFIX,
                self.rng.gen_range(REFERENCE_RANGE)
            ),
            donation_id: format!(
                "{}{:04}",
                DONATION_ID_PREFIX,
                self.rng.gen_range(DONATION_ID_RANGE)
            ),
            operator_id: format!("{:04}", self.rng.gen_range(OPERATOR_ID_RANGE)),
            lot_number: format!(
                "{}{:06}{}",
                LOT_PREFIX,
                self.rng.gen_range(LOT_RANGE),
                LOT_SUFFIX
            ),
        }
    }

    pub fn lipemic_reading(&mut self) -> LipemicReading {
        LipemicReading::classify(self.rng.gen_range(LIPEMIC_RANGE))
    }

    /// Placeholder checksum for status messages (four decimal digits).
    pub fn status_checksum(&mut self) -> String {
        self.rng.gen_range(STATUS_CHECKSUM_RANGE).to_string()
    }

    /// Placeholder checksum for donation messages (two uppercase hex digits).
    pub fn donation_checksum(&mut self) -> String {
        format!("{:02X}", self.rng.gen_range(DONATION_CHECKSUM_RANGE))
    }

    /// Uniform delay in `[min, max)`, or `min` when the range is empty.
    pub fn delay_between(&mut self, min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        let min_ms = min.as_millis() as u64;
        let max_ms = max.as_millis() as u64;
        if max_ms <= min_ms {
            return min;
        }
        Duration::from_millis(self.rng.gen_range(min_ms..max_ms))
    }

    /// Build a status message with a fresh checksum.
    pub fn status_message(
        &mut self,
        serial: &str,
        status: DeviceStatus,
        pending: usize,
        timestamp: NaiveDateTime,
    ) -> StatusMessage {
        StatusMessage {
            serial: serial.to_string(),
            status,
            timestamp,
            pending,
            checksum: self.status_checksum(),
        }
    }

    /// Build a donation message with fresh barcodes, reading and checksum.
    pub fn donation_message(
        &mut self,
        serial: &str,
        variant: FormatVariant,
        timestamp: NaiveDateTime,
    ) -> DonationMessage {
        let barcodes = self.barcodes();
        let lipemic = self.lipemic_reading();
        DonationMessage {
            serial: serial.to_string(),
            timestamp,
            variant,
            barcodes,
            lipemic,
            checksum: self.donation_checksum(),
        }
    }
}

impl Default for DataGenerator {
    fn default() -> Self {
        Self::from_entropy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    #[test]
    fn test_barcode_shapes() {
        let mut generator = DataGenerator::from_seed(7);
        for _ in 0..100 {
            let barcodes = generator.barcodes();

            assert!(barcodes.reference.starts_with(REFERENCE_PREFIX));
            assert_eq!(barcodes.reference.len(), 10);
            assert!(barcodes.reference[3..].chars().all(|c| c.is_ascii_digit()));

            assert!(barcodes.donation_id.starts_with(DONATION_ID_PREFIX));
            assert_eq!(barcodes.donation_id.len(), 14);

            assert_eq!(barcodes.operator_id.len(), 4);
            assert!(barcodes.operator_id.chars().all(|c| c.is_ascii_digit()));

            assert!(barcodes.lot_number.starts_with(LOT_PREFIX));
            assert!(barcodes.lot_number.ends_with(LOT_SUFFIX));
            assert_eq!(barcodes.lot_number.len(), 10);
        }
    }

    #[test]
    fn test_lipemic_values_in_range() {
        let mut generator = DataGenerator::from_seed(11);
        for _ in 0..500 {
            let reading = generator.lipemic_reading();
            assert!(LIPEMIC_RANGE.contains(&reading.value));
            assert_eq!(reading, LipemicReading::classify(reading.value));
        }
    }

    #[test]
    fn test_checksum_tokens() {
        let mut generator = DataGenerator::from_seed(3);
        for _ in 0..100 {
            let status = generator.status_checksum();
            let value: u32 = status.parse().unwrap();
            assert!(STATUS_CHECKSUM_RANGE.contains(&value));

            let donation = generator.donation_checksum();
            assert_eq!(donation.len(), 2);
            let value = u32::from_str_radix(&donation, 16).unwrap();
            assert!(DONATION_CHECKSUM_RANGE.contains(&value));
        }
    }

    #[test]
    fn test_same_seed_same_output() {
        let timestamp = Local::now().naive_local();
        let mut a = DataGenerator::from_seed(42);
        let mut b = DataGenerator::from_seed(42);

        let first = a.donation_message("LD0000001", FormatVariant::AllBarcodes, timestamp);
        let second = b.donation_message("LD0000001", FormatVariant::AllBarcodes, timestamp);
        assert_eq!(first, second);
        assert_eq!(a.device_status(), b.device_status());
        assert_eq!(a.format_variant(), b.format_variant());
    }

    #[test]
    fn test_random_choices_cover_all_values() {
        let mut generator = DataGenerator::from_seed(99);
        let mut statuses = std::collections::HashSet::new();
        let mut variants = std::collections::HashSet::new();
        for _ in 0..200 {
            statuses.insert(generator.device_status());
            variants.insert(generator.format_variant());
        }
        assert_eq!(statuses.len(), DeviceStatus::all().len());
        assert_eq!(variants.len(), FormatVariant::all().len());
    }

    #[test]
    fn test_delay_between_bounds() {
        let mut generator = DataGenerator::from_seed(5);
        let min = Duration::from_millis(3000);
        let max = Duration::from_millis(4000);
        for _ in 0..100 {
            let delay = generator.delay_between(min, max);
            assert!(delay >= min && delay < max);
        }
        assert_eq!(generator.delay_between(max, min), max);
        assert_eq!(generator.delay_between(min, min), min);
    }

    #[test]
    fn test_generated_messages_encode() {
        let mut generator = DataGenerator::from_seed(1);
        let timestamp = Local::now().naive_local();
        for variant in FormatVariant::all() {
            let message = generator.donation_message("LD0000002", *variant, timestamp);
            assert!(message.encode().is_ok());
        }
        let status = generator.status_message("LD0000002", DeviceStatus::Idle, 4, timestamp);
        assert!(status.encode().is_ok());
    }
}
