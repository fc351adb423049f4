//! End-to-end programming sessions against the emulated controller.

use std::time::Duration;

use rtdisp::constants::PAGE_SIZE;
use rtdisp::transport::{Emulator, EmulatorLines, I2cTransport, SoftwareI2c};
use rtdisp::{ChipDB, Error, Flashing, Session, SessionState};

fn open<T: I2cTransport>(transport: T) -> Flashing<T> {
    let mut session = Session::new(transport);
    session.init(0, None).unwrap();
    Flashing::new(session, &ChipDB::load().unwrap()).unwrap()
}

fn firmware(len: usize) -> Vec<u8> {
    let mut seed = 0xC0FFEEu32;
    (0..len)
        .map(|i| {
            // leave some erased pages in the image
            if (i / PAGE_SIZE) % 5 == 3 {
                return 0xFF;
            }
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            (seed >> 16) as u8
        })
        .collect()
}

// --- program / read ---

#[test]
fn test_erase_program_read_back() {
    let image = firmware(64 * 1024);
    let mut f = open(Emulator::default().with_contents(vec![0x00; 512 * 1024]));

    f.erase().unwrap();
    f.program(&image, |_, _, _| ()).unwrap();
    let data = f.read(image.len() as u32, |_, _, _| ()).unwrap();
    assert_eq!(data, image);
    f.verify(&image).unwrap();

    let emulator = f.session().transport();
    assert!(emulator.flash_protected());
    assert_eq!(emulator.stats().erases, 1);
}

#[test]
fn test_blank_pages_are_not_sent() {
    let image = firmware(20 * PAGE_SIZE);
    let blank = image
        .chunks(PAGE_SIZE)
        .filter(|p| p.iter().all(|&b| b == 0xFF))
        .count();
    assert_eq!(blank, 4);

    let mut f = open(Emulator::default());
    f.program(&image, |_, _, _| ()).unwrap();
    assert_eq!(f.session().transport().stats().pages_programmed, 20 - blank);
}

#[test]
fn test_transaction_limits_change_traffic_not_contents() {
    let image = firmware(8 * PAGE_SIZE);

    let mut unlimited = open(Emulator::default());
    unlimited.program(&image, |_, _, _| ()).unwrap();

    let mut limited = open(Emulator::default().with_limits(16, 16));
    limited.program(&image, |_, _, _| ()).unwrap();
    assert_eq!(
        limited.read(image.len() as u32, |_, _, _| ()).unwrap(),
        image
    );

    let a = unlimited.session().transport();
    let b = limited.session().transport();
    assert_eq!(a.flash(), b.flash());
    assert!(b.stats().writes > a.stats().writes);
}

#[test]
fn test_busy_programmer_is_waited_for() {
    let image = firmware(4 * PAGE_SIZE);
    let mut f = open(Emulator::default().with_busy_polls(5));
    f.program(&image, |_, _, _| ()).unwrap();
    assert_eq!(&f.session().transport().flash()[..image.len()], &image[..]);
}

#[test]
fn test_progress_ends_at_range_end() {
    let mut f = open(Emulator::default());
    let mut reports = Vec::new();
    f.read(1000, |start, end, cur| reports.push((start, end, cur)))
        .unwrap();
    assert_eq!(reports.first(), Some(&(0, 1000, 0)));
    assert_eq!(reports.last(), Some(&(0, 1000, 1000)));
    assert!(reports.windows(2).all(|w| w[0].2 <= w[1].2));
}

// --- failures ---

#[test]
fn test_verification_failure_is_distinct() {
    // programming cannot set bits that are already 0
    let mut f = open(Emulator::default().with_contents(vec![0x0F; 512 * 1024]));
    let err = f.program(&[0xF0; PAGE_SIZE], |_, _, _| ()).unwrap_err();
    assert!(err.is_verification_failure());
    assert!(matches!(err, Error::VerificationFailed { .. }));
}

#[test]
fn test_silent_controller_fails_to_enter_isp() {
    let mut session = Session::new(Emulator::default().nack_writes());
    session.init(0, None).unwrap();
    let err = Flashing::new(session, &ChipDB::load().unwrap())
        .err()
        .unwrap();
    assert!(matches!(err, Error::EnterIspFailed));
}

#[test]
fn test_lost_ack_aborts_programming() {
    let image = firmware(16 * PAGE_SIZE);
    // writes needed to identify the flash
    let setup = open(Emulator::default()).session().transport().stats().writes;

    let mut f = open(Emulator::default().nack_after_writes(setup + 20));
    let err = f.program(&image, |_, _, _| ()).unwrap_err();
    assert!(matches!(err, Error::NoAck { .. }));
    assert!(!err.is_verification_failure());

    let emulator = f.session().transport();
    assert!(emulator.stats().pages_programmed < 16);
    assert_ne!(&emulator.flash()[..image.len()], &image[..]);
    assert_eq!(f.session().state(), SessionState::IspActive);
}

#[test]
fn test_reading_past_address_space_is_rejected() {
    let mut f = open(Emulator::default().with_jedec_id(0x123456));
    let err = f.read(0x100_0001, |_, _, _| ()).unwrap_err();
    assert!(matches!(err, Error::ReadTooLarge { .. }));

    let err = f.program(&vec![0; 0x100_0001], |_, _, _| ()).unwrap_err();
    assert!(matches!(err, Error::ImageTooLarge { capacity: 0x100_0000, .. }));
}

#[test]
fn test_close_reboots_controller() {
    let contents = firmware(2048);
    let mut f = open(Emulator::default().with_contents(contents.clone()));
    assert_eq!(f.read(1024, |_, _, _| ()).unwrap(), &contents[..1024]);
    assert!(f.session().transport().isp_enabled());

    let session = f.close().unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!session.transport().isp_enabled());
}

#[test]
fn test_reset_leaves_isp() {
    let mut f = open(Emulator::default());
    f.reset();
    assert_eq!(f.session().state(), SessionState::Initialized);
    assert!(!f.session().transport().isp_enabled());
    let mut session = f.into_session();
    session.deinit().unwrap();
    assert_eq!(session.state(), SessionState::Closed);
}

// --- bit-banged bus ---

#[test]
fn test_bitbanged_session() {
    let lines = EmulatorLines::new(Emulator::default().with_jedec_id(0xC84013));
    let bus = SoftwareI2c::new(lines).with_half_period(Duration::ZERO);
    let mut f = open(bus);
    assert_eq!(f.chip().unwrap().name, "GD25Q40");

    let image = firmware(3 * PAGE_SIZE + 17);
    f.erase().unwrap();
    f.program(&image, |_, _, _| ()).unwrap();
    assert_eq!(f.read(image.len() as u32, |_, _, _| ()).unwrap(), image);
}

#[test]
fn test_bitbanged_absent_controller() {
    let lines = EmulatorLines::new(Emulator::default().absent());
    let mut bus = SoftwareI2c::new(lines).with_half_period(Duration::ZERO);
    bus.init(0, None).unwrap();
    assert!(!bus.detect(rtdisp::constants::ISP_ADDRESS).unwrap());
}
