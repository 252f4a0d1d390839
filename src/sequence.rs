//! One boot attempt, from looking for an update to the leap into the application.
//!
//! ```text
//! Idle -> CheckForUpdate -> NoUpdate | MetadataMatch | Erasing -> Writing -> PersistingMetadata
//!      -> Validating -> Jumping
//! ```
//!
//! Any failure ends the attempt in a [`Halt`]; nothing is retried.

use embedded_io_async::{ErrorKind, Read, Seek};

use crate::{
    Config, Error,
    boot::{Boot, Leap},
    flash::{FlashController, FlashUpdater, Progress},
    image, log,
    metadata::{self, UpdateMetadata},
    validate::{CheckFailure, MAX_TABLE_BYTES, Validator},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    Idle,
    CheckForUpdate,
    NoUpdate,
    MetadataMatch,
    Erasing,
    Writing,
    PersistingMetadata,
    Validating,
    Jumping,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpdateOutcome {
    /// No medium, no image on it, an empty image, or a medium that could not be opened.
    NoUpdate,
    /// The image on the medium is the one already in flash.
    MetadataMatch,
    Updated,
}

/// Removable storage holding the update image.
#[allow(async_fn_in_trait)]
pub trait UpdateMedium {
    type Image: Read + Seek;

    /// Mount the medium and open the update image, `None` if either is missing.
    async fn open(&mut self) -> Result<Option<Self::Image>, ErrorKind>;

    /// Close the image, deleting it when `remove` is set, and release the medium.
    async fn close(&mut self, image: Self::Image, remove: bool) -> Result<(), ErrorKind>;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HaltReason {
    Update(Error),
    /// The application is not safe to run.
    Rejected(CheckFailure),
}

/// End of a failed boot attempt.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Halt {
    /// Phase the failure happened in.
    pub phase: Phase,
    pub reason: HaltReason,
}

pub struct Bootloader<C, M> {
    updater: FlashUpdater<C>,
    medium: M,
    validator: Validator,
}

impl<C: FlashController, M: UpdateMedium> Bootloader<C, M> {
    pub fn new(controller: C, medium: M, config: Config) -> Self {
        let updater = FlashUpdater::new(controller, config);
        let validator = Validator::new(&config, updater.region_end());
        Bootloader {
            updater,
            medium,
            validator,
        }
    }

    pub fn updater(&self) -> &FlashUpdater<C> {
        &self.updater
    }

    pub fn medium(&self) -> &M {
        &self.medium
    }

    pub fn phase(&self) -> Phase {
        self.updater.phase()
    }

    pub fn release(self) -> (C, M) {
        (self.updater.release(), self.medium)
    }

    /// Apply the update image on the medium, unless it is already in flash.
    ///
    /// A medium that cannot be mounted or opened counts as no update. Once the image is open, read
    /// errors fail the check. The image is closed on every path, and deleted only after a
    /// successful update when so configured.
    pub async fn check_for_update(&mut self, sink: &mut impl Progress) -> Result<UpdateOutcome, Error> {
        self.updater.enter(Phase::CheckForUpdate);

        let mut file = match self.medium.open().await {
            Ok(Some(file)) => file,
            Ok(None) => {
                log::info!("no update image found");
                self.updater.enter(Phase::NoUpdate);
                return Ok(UpdateOutcome::NoUpdate);
            }
            Err(e) => {
                // Nothing is erased yet, the application in flash stays usable.
                log::warn!("update medium unreadable: {}", e);
                self.updater.enter(Phase::NoUpdate);
                return Ok(UpdateOutcome::NoUpdate);
            }
        };

        let outcome = self.update_from(&mut file, sink).await;

        let remove = self.updater.config().delete_update && outcome == Ok(UpdateOutcome::Updated);
        if let Err(e) = self.medium.close(file, remove).await {
            log::warn!("releasing the update medium failed: {}", e);
        }
        outcome
    }

    async fn update_from(
        &mut self,
        file: &mut M::Image,
        sink: &mut impl Progress,
    ) -> Result<UpdateOutcome, Error> {
        let len = image::image_len(file).await?;
        if len == 0 {
            log::info!("update image is empty");
            self.updater.enter(Phase::NoUpdate);
            return Ok(UpdateOutcome::NoUpdate);
        }

        let candidate = self.updater.compute(file, len).await?;
        let config = *self.updater.config();
        let stored = if config.store_metadata {
            self.updater.stored_metadata().await?
        } else {
            None
        };
        if config.log_metadata {
            log_metadata(&candidate, stored.as_ref());
        }

        if metadata::matches(&candidate, stored.as_ref()) {
            log::info!("update image already in flash");
            self.updater.enter(Phase::MetadataMatch);
            return Ok(UpdateOutcome::MetadataMatch);
        }

        image::rewind(file).await?;
        self.updater.apply(&candidate, file, sink).await?;
        log::info!("update of {=u32} bytes applied", candidate.app_size);
        Ok(UpdateOutcome::Updated)
    }

    /// Check the vector table of the application in flash.
    pub async fn validate(&mut self) -> Result<Leap, Halt> {
        self.updater.enter(Phase::Validating);

        let mut buf = [0u8; MAX_TABLE_BYTES];
        let table = match self
            .updater
            .read_vector_table(self.validator.table_len(), &mut buf)
            .await
        {
            Ok(table) => table,
            Err(e) => return Err(self.halt(HaltReason::Update(e))),
        };

        match self.validator.pre_check(&table) {
            Ok(leap) => {
                self.updater.enter(Phase::Jumping);
                Ok(leap)
            }
            Err(failure) => Err(self.halt(HaltReason::Rejected(failure))),
        }
    }

    /// Run the boot attempt up to the jump.
    pub async fn run(&mut self, sink: &mut impl Progress) -> Result<Leap, Halt> {
        log::info!(
            "bootleap {=str}, application at {=u32:#x}",
            env!("CARGO_PKG_VERSION"),
            self.updater.config().app_base
        );

        match self.check_for_update(sink).await {
            Ok(outcome) => log::info!("update check: {}", outcome),
            Err(e) => return Err(self.halt(HaltReason::Update(e))),
        }
        self.validate().await
    }

    fn halt(&self, reason: HaltReason) -> Halt {
        let halt = Halt {
            phase: self.updater.phase(),
            reason,
        };
        log::error!("boot halted in {}: {}", halt.phase, halt.reason);
        halt
    }
}

/// Enter the application, or stay put when the boot attempt failed.
///
/// A halted bootloader spins instead of resetting, so a bad image cannot cause a reboot loop.
pub fn conclude<B: Boot>(attempt: Result<Leap, Halt>) -> ! {
    match attempt {
        // SAFETY: the leap comes from a vector table that passed the enabled checks.
        Ok(leap) => unsafe { B::boot(leap) },
        Err(_) => loop {
            core::hint::spin_loop();
        },
    }
}

fn log_metadata(candidate: &UpdateMetadata, stored: Option<&UpdateMetadata>) {
    candidate.log("update image");
    match stored {
        Some(stored) => stored.log("flash"),
        None => log::info!("no metadata in flash"),
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::{
        flash::{FlashError, ProgressEvent, Stage},
        hash::HashAlgorithm,
        mock::{MockImage, MockMedium, SimulatedFlash},
        validate::{Check, CheckTier, Defect},
    };

    const APP_BASE: u32 = 0x4000;
    const STACK_TOP: u32 = 0x2002_7000;
    const RESET: u32 = APP_BASE + 0x101;

    /// Application image starting with a plausible vector table.
    fn application(len: usize) -> Vec<u8> {
        let mut data: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
        data[..4].copy_from_slice(&STACK_TOP.to_le_bytes());
        data[4..8].copy_from_slice(&RESET.to_le_bytes());
        data
    }

    fn boot(
        flash: SimulatedFlash,
        medium: MockMedium,
        config: Config,
    ) -> (Result<Leap, Halt>, Vec<ProgressEvent>, Bootloader<SimulatedFlash, MockMedium>) {
        let mut bootloader = Bootloader::new(flash, medium, config);
        let mut events = Vec::new();
        let result =
            embassy_futures::block_on(bootloader.run(&mut |event: ProgressEvent| events.push(event)));
        (result, events, bootloader)
    }

    #[test]
    fn update_then_match() {
        let data = application(10_000);
        let config = Config::tiny(APP_BASE);
        assert_eq!(config.hash, HashAlgorithm::Crc32);

        let (result, events, bootloader) =
            boot(SimulatedFlash::new(), MockMedium::with_image(data.clone()), config);
        let leap = result.unwrap();
        assert_eq!(leap, Leap::new(APP_BASE, STACK_TOP, RESET));
        assert_eq!(bootloader.phase(), Phase::Jumping);

        let erases = events.iter().filter(|e| e.stage == Stage::Erase).count();
        assert_eq!(erases, 3);
        assert_eq!(events.last(), Some(&ProgressEvent::write(10_000, 10_000)));

        let (flash, medium) = bootloader.release();
        assert_eq!(flash.contents(APP_BASE, data.len()), &data[..]);
        assert_eq!((medium.closed, medium.removed), (1, false));
        let (erased, programmed) = (flash.erases, flash.programs);

        // Same image again.
        let (result, events, bootloader) = boot(flash, medium, config);
        assert_eq!(result, Ok(leap));
        assert!(events.is_empty());
        let flash = bootloader.updater().controller();
        assert_eq!((flash.erases, flash.programs), (erased, programmed));
        assert_eq!(flash.unlocks, 1);
    }

    #[test]
    fn outcome_of_the_update_check() {
        let data = application(1_000);
        let mut bootloader = Bootloader::new(
            SimulatedFlash::new(),
            MockMedium::with_image(data.clone()),
            Config::tiny(APP_BASE),
        );
        let mut sink = |_: ProgressEvent| {};

        embassy_futures::block_on(async {
            assert_eq!(
                bootloader.check_for_update(&mut sink).await,
                Ok(UpdateOutcome::Updated)
            );
            assert_eq!(bootloader.phase(), Phase::PersistingMetadata);
            assert_eq!(
                bootloader.check_for_update(&mut sink).await,
                Ok(UpdateOutcome::MetadataMatch)
            );
            assert_eq!(bootloader.phase(), Phase::MetadataMatch);
        });
    }

    #[test]
    fn nothing_to_update() {
        let flashed = application(2_000);
        let mut flash = SimulatedFlash::new();
        flash.poke(APP_BASE, &flashed);

        for medium in [MockMedium::empty(), MockMedium::with_image(Vec::new())] {
            let (result, events, bootloader) = boot(flash.clone(), medium, Config::tiny(APP_BASE));
            assert_eq!(result.unwrap().reset(), RESET);
            assert!(events.is_empty());
            assert_eq!(bootloader.updater().controller().unlocks, 0);
        }
    }

    #[test]
    fn without_record_every_boot_updates() {
        let data = application(3_000);
        let config = Config {
            store_metadata: false,
            ..Config::tiny(APP_BASE)
        };

        let (result, events, bootloader) =
            boot(SimulatedFlash::new(), MockMedium::with_image(data.clone()), config);
        assert_eq!(result, Ok(Leap::new(APP_BASE, STACK_TOP, RESET)));
        assert_eq!(events.first(), Some(&ProgressEvent::erase(1, 1)));
        let (flash, medium) = bootloader.release();
        let (erased, programmed) = (flash.erases, flash.programs);
        assert_eq!((erased, programmed), (1, 750));

        let (result, events, bootloader) = boot(flash, medium, config);
        assert_eq!(result, Ok(Leap::new(APP_BASE, STACK_TOP, RESET)));
        assert_eq!(events.last(), Some(&ProgressEvent::write(3_000, 3_000)));
        let flash = bootloader.updater().controller();
        assert_eq!((flash.erases, flash.programs), (2 * erased, 2 * programmed));
        assert_eq!(flash.wear.erases(0x3_E000), 0);
        assert_eq!(flash.contents(APP_BASE, data.len()), &data[..]);
    }

    #[test]
    fn image_is_deleted_after_update() {
        let config = Config {
            delete_update: true,
            ..Config::tiny(APP_BASE)
        };
        let (result, _, bootloader) =
            boot(SimulatedFlash::new(), MockMedium::with_image(application(600)), config);
        result.unwrap();

        let (flash, medium) = bootloader.release();
        assert!(medium.removed);
        assert!(medium.image.is_none());

        let (result, events, _) = boot(flash, medium, config);
        result.unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn failed_update_keeps_the_image() {
        let data = application(10_000);
        let mut flash = SimulatedFlash::new();
        flash.corrupt = Some(APP_BASE + 5_000);
        let config = Config {
            delete_update: true,
            ..Config::tiny(APP_BASE)
        };

        let (result, events, bootloader) = boot(flash, MockMedium::with_image(data), config);
        assert_eq!(
            result,
            Err(Halt {
                phase: Phase::Writing,
                reason: HaltReason::Update(Error::Verify {
                    address: APP_BASE + 5_000
                }),
            })
        );
        assert_eq!(events.last(), Some(&ProgressEvent::write(4_608, 10_000)));

        let medium = bootloader.medium();
        assert_eq!((medium.closed, medium.removed), (1, false));
        assert_eq!(
            embassy_futures::block_on(bootloader.updater().stored_metadata()),
            Ok(None)
        );
    }

    #[test]
    fn image_changing_between_passes_halts() {
        let data = application(5_000);
        // The second rewind happens right before programming.
        let image = MockImage::new(data).with_tamper(2, 3_000);
        let (result, _, bootloader) = boot(
            SimulatedFlash::new(),
            MockMedium::with(image),
            Config::full(APP_BASE),
        );
        assert_eq!(
            result,
            Err(Halt {
                phase: Phase::Writing,
                reason: HaltReason::Update(Error::SourceChanged),
            })
        );
        assert_eq!(
            embassy_futures::block_on(bootloader.updater().stored_metadata()),
            Ok(None)
        );
    }

    #[test]
    fn unreadable_medium_boots_the_flashed_application() {
        let mut flash = SimulatedFlash::new();
        flash.poke(APP_BASE, &application(2_000));

        for kind in [ErrorKind::NotFound, ErrorKind::Other] {
            let (result, events, bootloader) =
                boot(flash.clone(), MockMedium::failing(kind), Config::tiny(APP_BASE));
            assert_eq!(result, Ok(Leap::new(APP_BASE, STACK_TOP, RESET)));
            assert!(events.is_empty());
            assert_eq!(bootloader.phase(), Phase::Jumping);
            assert_eq!(bootloader.medium().closed, 0);
            assert_eq!(bootloader.updater().controller().unlocks, 0);
        }
    }

    #[test]
    fn unreadable_medium_is_no_update() {
        let mut bootloader = Bootloader::new(
            SimulatedFlash::new(),
            MockMedium::failing(ErrorKind::Other),
            Config::tiny(APP_BASE),
        );
        let outcome = embassy_futures::block_on(bootloader.check_for_update(&mut |_: ProgressEvent| {}));
        assert_eq!(outcome, Ok(UpdateOutcome::NoUpdate));
        assert_eq!(bootloader.phase(), Phase::NoUpdate);
    }

    #[test]
    fn read_errors_halt() {
        let image = MockImage::new(application(2_000)).with_failure_at(1_024);
        let (result, _, bootloader) =
            boot(SimulatedFlash::new(), MockMedium::with(image), Config::tiny(APP_BASE));
        assert_eq!(
            result,
            Err(Halt {
                phase: Phase::CheckForUpdate,
                reason: HaltReason::Update(Error::Read(ErrorKind::Other)),
            })
        );
        assert_eq!(bootloader.medium().closed, 1);
        assert_eq!(bootloader.updater().controller().unlocks, 0);
    }

    #[test]
    fn oversized_image_is_refused_before_erasing() {
        let data = application(0x4_0000);
        let (result, events, bootloader) = boot(
            SimulatedFlash::new(),
            MockMedium::with_image(data),
            Config::tiny(APP_BASE),
        );
        assert!(matches!(
            result.unwrap_err().reason,
            HaltReason::Update(Error::ImageTooLarge { .. })
        ));
        assert!(events.is_empty());
        assert_eq!(bootloader.updater().controller().erases, 0);
    }

    #[test]
    fn flash_timeout_halts_while_erasing() {
        let mut flash = SimulatedFlash::new();
        flash.stuck = true;
        let (result, _, bootloader) = boot(
            flash,
            MockMedium::with_image(application(1_000)),
            Config::tiny(APP_BASE),
        );
        assert_eq!(
            result,
            Err(Halt {
                phase: Phase::Erasing,
                reason: HaltReason::Update(Error::Flash(FlashError::Timeout {
                    address: APP_BASE
                })),
            })
        );
        let flash = bootloader.updater().controller();
        assert_eq!((flash.unlocks, flash.locks), (1, 1));
    }

    #[test]
    fn erased_application_is_rejected() {
        let (result, _, _) = boot(SimulatedFlash::new(), MockMedium::empty(), Config::tiny(APP_BASE));
        assert_eq!(
            result,
            Err(Halt {
                phase: Phase::Validating,
                reason: HaltReason::Rejected(CheckFailure {
                    index: 0,
                    check: Check::StackTop,
                    value: 0xFFFF_FFFF,
                    defect: Defect::Erased,
                }),
            })
        );
    }

    #[test]
    fn reset_vector_into_the_record_is_rejected() {
        let mut data = application(2_000);
        data[4..8].copy_from_slice(&0x3_FFF5u32.to_le_bytes());
        let mut flash = SimulatedFlash::new();
        flash.poke(APP_BASE, &data);

        let (result, _, _) = boot(flash.clone(), MockMedium::empty(), Config::tiny(APP_BASE));
        let failure = match result.unwrap_err().reason {
            HaltReason::Rejected(failure) => failure,
            other => panic!("unexpected halt {other:?}"),
        };
        assert_eq!(failure.check, Check::Reset);
        assert_eq!(failure.defect, Defect::OutsideApplication);

        // Without a record the application owns flash up to its end.
        let config = Config {
            store_metadata: false,
            ..Config::tiny(APP_BASE)
        };
        let (result, _, _) = boot(flash, MockMedium::empty(), config);
        assert_eq!(result.unwrap().reset(), 0x3_FFF5);
    }

    #[test]
    fn full_checks_after_update() {
        let mut data = application(4_096);
        // Zero reserved slots, valid handlers everywhere else.
        for slot in 2..16 + 144 {
            let word = match slot {
                7..=10 | 13 => 0,
                _ => RESET,
            };
            data[slot * 4..slot * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }

        let (result, _, _) = boot(
            SimulatedFlash::new(),
            MockMedium::with_image(data.clone()),
            Config::full(APP_BASE),
        );
        assert_eq!(result.unwrap().reset(), RESET);

        // A stray value in a reserved slot is only caught by the full tier.
        data[9 * 4] = 1;
        for (tier, passes) in [
            (CheckTier::Minimal, true),
            (CheckTier::Extended, true),
            (CheckTier::Full, false),
        ] {
            let config = Config {
                check_tier: Some(tier),
                ..Config::full(APP_BASE)
            };
            let (result, _, _) = boot(
                SimulatedFlash::new(),
                MockMedium::with_image(data.clone()),
                config,
            );
            assert_eq!(result.is_ok(), passes, "{tier:?}");
        }
    }

    #[test]
    fn dry_run_leaves_flash_alone() {
        let config = Config {
            dry_run: true,
            check_tier: None,
            ..Config::tiny(APP_BASE)
        };
        let (result, events, bootloader) = boot(
            SimulatedFlash::new(),
            MockMedium::with_image(application(10_000)),
            config,
        );
        result.unwrap();
        assert_eq!(events.len(), 3 + 20);

        let flash = bootloader.updater().controller();
        assert_eq!((flash.erases, flash.programs), (0, 0));
        assert_eq!(
            embassy_futures::block_on(bootloader.updater().stored_metadata()),
            Ok(None)
        );
    }
}
