//! Bit-exact layouts of the fbclock shared-memory state, v1 (CRC-guarded) and
//! v2 (seqlock-guarded). These are plain data; the atomics discipline that
//! makes reading them safe without a kernel lock lives in `fbclock::shm`.

/// Shared-memory state, protocol v1.
///
/// Little-endian, `#[repr(C)]`, 8-byte aligned, 48 bytes total. The `crc`
/// field is read/written through `AtomicU64` by the caller; it is declared as
/// a plain `u64` here purely to fix the byte layout, matching the
/// `perf_event_mmap_page` convention of describing the mmap'd region as an
/// ordinary struct and only reaching for atomic views where synchronization
/// actually happens.
#[repr(C)]
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Default,
    zerocopy::IntoBytes,
    zerocopy::FromBytes,
    zerocopy::Immutable,
    zerocopy::KnownLayout,
)]
pub struct ShmStateV1 {
    pub crc: u64,
    pub ingress_time_ns: i64,
    pub error_bound_ns: u32,
    pub holdover_multiplier_ns: u32,
    pub clock_smearing_start_s: u64,
    pub clock_smearing_end_s: u64,
    pub utc_offset_pre_s: i32,
    pub utc_offset_post_s: i32,
}

/// Shared-memory state, protocol v2.
///
/// Little-endian, `#[repr(C)]`, 8-byte aligned, 64 bytes total. `seq` plays
/// the role `crc` plays in v1.
#[repr(C)]
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Default,
    zerocopy::IntoBytes,
    zerocopy::FromBytes,
    zerocopy::Immutable,
    zerocopy::KnownLayout,
)]
pub struct ShmStateV2 {
    pub seq: u64,
    pub ingress_time_ns: i64,
    pub error_bound_ns: u32,
    pub holdover_multiplier_ns: u32,
    pub clock_smearing_start_s: u64,
    pub utc_offset_pre_s: i16,
    pub utc_offset_post_s: i16,
    pub clock_id: u32,
    pub phc_time_ns: i64,
    pub sysclock_time_ns: i64,
    pub coef_ppb: i64,
}

/// Fixed smearing-window duration for v2, where `clock_smearing_end_s` is not
/// stored but derived as `clock_smearing_start_s + V2_SMEAR_DURATION_S`.
pub const V2_SMEAR_DURATION_S: u64 = 62_500;

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn v1_layout_matches_wire_format() {
        assert_eq!(size_of::<ShmStateV1>(), 48);
        assert_eq!(memoffset::offset_of!(ShmStateV1, crc), 0);
        assert_eq!(memoffset::offset_of!(ShmStateV1, ingress_time_ns), 8);
        assert_eq!(memoffset::offset_of!(ShmStateV1, error_bound_ns), 16);
        assert_eq!(
            memoffset::offset_of!(ShmStateV1, holdover_multiplier_ns),
            20
        );
        assert_eq!(
            memoffset::offset_of!(ShmStateV1, clock_smearing_start_s),
            24
        );
        assert_eq!(memoffset::offset_of!(ShmStateV1, clock_smearing_end_s), 32);
        assert_eq!(memoffset::offset_of!(ShmStateV1, utc_offset_pre_s), 40);
        assert_eq!(memoffset::offset_of!(ShmStateV1, utc_offset_post_s), 44);
    }

    #[test]
    fn v2_layout_matches_wire_format() {
        assert_eq!(size_of::<ShmStateV2>(), 64);
        assert_eq!(memoffset::offset_of!(ShmStateV2, seq), 0);
        assert_eq!(memoffset::offset_of!(ShmStateV2, ingress_time_ns), 8);
        assert_eq!(memoffset::offset_of!(ShmStateV2, error_bound_ns), 16);
        assert_eq!(
            memoffset::offset_of!(ShmStateV2, holdover_multiplier_ns),
            20
        );
        assert_eq!(
            memoffset::offset_of!(ShmStateV2, clock_smearing_start_s),
            24
        );
        assert_eq!(memoffset::offset_of!(ShmStateV2, utc_offset_pre_s), 32);
        assert_eq!(memoffset::offset_of!(ShmStateV2, utc_offset_post_s), 34);
        assert_eq!(memoffset::offset_of!(ShmStateV2, clock_id), 36);
        assert_eq!(memoffset::offset_of!(ShmStateV2, phc_time_ns), 40);
        assert_eq!(memoffset::offset_of!(ShmStateV2, sysclock_time_ns), 48);
        assert_eq!(memoffset::offset_of!(ShmStateV2, coef_ppb), 56);
    }
}
