//! Erase, program and verify the application region from an update image.
//!
//! An update streams the image through a 512 byte scratch buffer. Every chunk is programmed a
//! word at a time and read back before the next one is taken from the image. The image is hashed
//! again while it is programmed; the metadata record is only persisted when that digest equals
//! the fingerprint taken before anything was erased.

use embedded_io_async::Read;
use embedded_storage_async::nor_flash::{NorFlash, ReadNorFlash};

use super::{
    CHUNK_SIZE, ERASED_BYTE, FlashController, FlashRange, Progress, ProgressEvent, ReadOnly,
    SectorSpan, Unlocked, WORD_SIZE,
};
use crate::{
    Address, Config, Error,
    flash::FlashError,
    hash::Hasher,
    image::{self, Fingerprinting},
    log,
    metadata::{self, RECORD_MAX, UpdateMetadata},
    sequence::Phase,
    validate::VectorTable,
};

struct Scratch {
    chunk: [u8; CHUNK_SIZE],
    readback: [u8; CHUNK_SIZE],
}

/// Where an update of a given size lands.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UpdatePlan {
    /// Bytes of the image, before padding to whole words.
    pub program: FlashRange,
    pub erase: SectorSpan,
    /// Metadata record, when persisted.
    pub slot: Option<FlashRange>,
    /// Sectors of the record not already erased along with the application.
    pub slot_erase: Option<SectorSpan>,
}

impl UpdatePlan {
    pub const fn sector_count(&self) -> u32 {
        match self.slot_erase {
            Some(span) => self.erase.count() + span.count(),
            None => self.erase.count(),
        }
    }
}

#[derive(Clone, Copy)]
struct Tally {
    done: u32,
    total: u32,
}

/// Exclusive owner of the flash controller during a boot attempt.
pub struct FlashUpdater<C> {
    controller: C,
    config: Config,
    scratch: Scratch,
    phase: Phase,
}

impl<C: FlashController> FlashUpdater<C> {
    pub fn new(controller: C, config: Config) -> Self {
        FlashUpdater {
            controller,
            config,
            scratch: Scratch {
                chunk: [0; CHUNK_SIZE],
                readback: [0; CHUNK_SIZE],
            },
            phase: Phase::Idle,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn release(self) -> C {
        self.controller
    }

    /// Step of the boot sequence the updater is in, also while an update is under way.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn enter(&mut self, phase: Phase) {
        log::debug!("entering {}", phase);
        self.phase = phase;
    }

    /// Where the metadata record is kept, if it is kept at all.
    pub fn metadata_slot(&self) -> Option<FlashRange> {
        self.config
            .store_metadata
            .then(|| metadata::slot(self.controller.capacity(), self.config.hash))
    }

    /// Where the application region ends: at the metadata record, or at the end of flash without one.
    pub fn region_end(&self) -> Address {
        match self.metadata_slot() {
            Some(slot) => slot.start,
            None => self.controller.capacity(),
        }
    }

    /// Usable application region: from the application base up to [`FlashUpdater::region_end`].
    pub fn region(&self) -> Result<FlashRange, Error> {
        FlashRange::new(self.config.app_base, self.region_end())
    }

    /// Work out the sectors to erase and where the image and its record go.
    pub fn plan(&self, app_size: u32) -> Result<UpdatePlan, Error> {
        let base = self.config.app_base;
        if base % C::SECTOR_SIZE != 0 {
            return Err(Error::InvalidRange {
                start: base,
                end: base.saturating_add(app_size),
            });
        }

        let region = self.region()?;
        if app_size > region.len() {
            return Err(Error::ImageTooLarge {
                size: app_size as u64,
                available: region.len(),
            });
        }

        let program = FlashRange::new(base, base + app_size)?;
        let erase = SectorSpan::covering(program, C::SECTOR_SIZE);

        let slot = self.metadata_slot();
        let slot_erase = slot.and_then(|slot| {
            let span = SectorSpan::covering(slot, C::SECTOR_SIZE);
            let first = span.first.max(erase.last + 1);
            (first <= span.last).then_some(SectorSpan { first, ..span })
        });

        Ok(UpdatePlan {
            program,
            erase,
            slot,
            slot_erase,
        })
    }

    /// Fingerprint the next `len` bytes of `source`.
    pub async fn compute<R: Read>(&mut self, source: &mut R, len: u32) -> Result<UpdateMetadata, Error> {
        let mut hasher = self.config.hash.hasher();
        metadata::compute(source, len, &mut hasher, &mut self.scratch.chunk).await
    }

    /// Metadata record left by the previous update.
    pub async fn stored_metadata(&self) -> Result<Option<UpdateMetadata>, Error> {
        metadata::read_stored(&mut ReadOnly::new(&self.controller), self.config.hash).await
    }

    /// Read the vector table of the application into `buf`, at most `len` bytes of it.
    ///
    /// The table is cut short where flash ends.
    pub async fn read_vector_table<'b>(&self, len: usize, buf: &'b mut [u8]) -> Result<VectorTable<'b>, Error> {
        let base = self.config.app_base;
        let available = self.controller.capacity().saturating_sub(base) as usize;
        let len = len.min(available).min(buf.len());

        let buf = &mut buf[..len];
        ReadOnly::new(&self.controller).read(base, buf).await?;
        VectorTable::new(buf).ok_or(Error::InvalidRange {
            start: base,
            end: base + len as u32,
        })
    }

    /// Erase every sector touching `range`, which has to lie within the application region.
    pub async fn erase(&mut self, range: FlashRange, sink: &mut impl Progress) -> Result<(), Error> {
        self.check_range(range)?;
        let span = SectorSpan::covering(range, C::SECTOR_SIZE);
        let dry_run = self.config.dry_run;

        let mut flash = Unlocked::new(&mut self.controller);
        let mut tally = Tally {
            done: 0,
            total: span.count(),
        };
        erase_sectors(&mut flash, span, dry_run, &mut tally, sink).await
    }

    /// Program `total_len` bytes from `source` starting at `address`, verifying every chunk.
    ///
    /// The sectors have to be erased already.
    pub async fn write<R: Read>(
        &mut self,
        address: Address,
        source: &mut R,
        total_len: u32,
        sink: &mut impl Progress,
    ) -> Result<(), Error> {
        let end = address.checked_add(total_len).ok_or(Error::InvalidRange {
            start: address,
            end: address,
        })?;
        let range = FlashRange::new(address, end)?;
        self.check_range(range)?;
        if address as usize % WORD_SIZE != 0 {
            return Err(Error::InvalidRange {
                start: address,
                end,
            });
        }

        let Self {
            controller,
            config,
            scratch,
            ..
        } = self;
        let mut flash = Unlocked::new(controller);
        write_image(&mut flash, range, source, scratch, config.dry_run, sink).await
    }

    /// Replace the application with the image described by `metadata`, read from `source`.
    ///
    /// `source` has to be positioned at the start of the image. The flash is unlocked once for the
    /// whole update and locked again however it ends.
    pub async fn apply<R: Read>(
        &mut self,
        metadata: &UpdateMetadata,
        source: &mut R,
        sink: &mut impl Progress,
    ) -> Result<(), Error> {
        let plan = self.plan(metadata.app_size)?;
        log::info!(
            "updating {=u32:#x}..{=u32:#x}, {=u32} sectors to erase",
            plan.program.start,
            plan.program.end,
            plan.sector_count()
        );

        let mut hasher = self.config.hash.hasher();
        hasher.start()?;

        let Self {
            controller,
            config,
            scratch,
            phase,
        } = self;
        let dry_run = config.dry_run;
        if dry_run {
            log::warn!("dry run, flash is left untouched");
        }

        let mut flash = Unlocked::new(controller);

        *phase = Phase::Erasing;
        let mut tally = Tally {
            done: 0,
            total: plan.sector_count(),
        };
        erase_sectors(&mut flash, plan.erase, dry_run, &mut tally, sink).await?;
        if let Some(span) = plan.slot_erase {
            erase_sectors(&mut flash, span, dry_run, &mut tally, sink).await?;
        }

        *phase = Phase::Writing;
        let mut tee = Fingerprinting::new(source, &mut hasher);
        write_image(&mut flash, plan.program, &mut tee, scratch, dry_run, sink).await?;
        tee.finish()?;

        if hasher.finish()? != metadata.hash {
            log::error!("update image changed while programming");
            return Err(Error::SourceChanged);
        }

        let Some(slot) = plan.slot else {
            return Ok(());
        };

        *phase = Phase::PersistingMetadata;
        let mut record = [0u8; RECORD_MAX];
        let bytes = metadata.encode(&mut record);
        program_verified(&mut flash, slot.start, bytes, &mut scratch.readback, dry_run).await?;

        if !dry_run {
            let stored = metadata::read_stored(&mut flash, config.hash).await?;
            if !metadata::matches(metadata, stored.as_ref()) {
                return Err(Error::MetadataVerify);
            }
        }
        Ok(())
    }

    fn check_range(&self, range: FlashRange) -> Result<(), Error> {
        let within = range.start >= self.config.app_base && range.end <= self.controller.capacity();
        if !within {
            return Err(Error::InvalidRange {
                start: range.start,
                end: range.end,
            });
        }
        Ok(())
    }
}

async fn erase_sectors<F>(
    flash: &mut F,
    span: SectorSpan,
    dry_run: bool,
    tally: &mut Tally,
    sink: &mut impl Progress,
) -> Result<(), Error>
where
    F: NorFlash<Error = FlashError>,
{
    let sector_size = F::ERASE_SIZE as u32;
    for address in span.addresses(sector_size) {
        log::trace!("erasing sector at {=u32:#x}", address);
        if !dry_run {
            flash.erase(address, address + sector_size).await?;
        }

        tally.done += 1;
        sink.report(ProgressEvent::erase(tally.done, tally.total));
    }
    Ok(())
}

/// Program `range.len()` bytes of `source` chunk by chunk, then make sure the source has ended.
async fn write_image<F, R>(
    flash: &mut F,
    range: FlashRange,
    source: &mut R,
    scratch: &mut Scratch,
    dry_run: bool,
    sink: &mut impl Progress,
) -> Result<(), Error>
where
    F: NorFlash<Error = FlashError>,
    R: Read,
{
    let total = range.len();
    let mut written: u32 = 0;
    while written < total {
        let address = range.start + written;
        let want = (total - written).min(CHUNK_SIZE as u32) as usize;
        let read = image::fill(source, &mut scratch.chunk[..want]).await?;
        if read < want {
            return Err(Error::SourceTruncated {
                expected: total,
                actual: written + read as u32,
            });
        }

        let last = written + read as u32 == total;
        let len = pad_chunk(&mut scratch.chunk, read, last, address)?;

        log::trace!("writing {=usize} bytes at {=u32:#x}", len, address);
        program_verified(flash, address, &scratch.chunk[..len], &mut scratch.readback, dry_run).await?;

        written += read as u32;
        sink.report(ProgressEvent::write(written, total));
    }

    image::expect_end(source, total).await
}

/// Pad the `len` bytes in `chunk` up to a whole word, returning the padded length.
///
/// Only the final chunk of an image may end within a word.
fn pad_chunk(chunk: &mut [u8; CHUNK_SIZE], len: usize, last: bool, address: Address) -> Result<usize, Error> {
    let padded = len.next_multiple_of(WORD_SIZE);
    if padded == len {
        return Ok(len);
    }
    if !last {
        return Err(Error::Padding { address });
    }

    chunk[len..padded].fill(ERASED_BYTE);
    Ok(padded)
}

/// Program `data` at `address` and compare it with what the flash reads back.
async fn program_verified<F>(
    flash: &mut F,
    address: Address,
    data: &[u8],
    readback: &mut [u8; CHUNK_SIZE],
    dry_run: bool,
) -> Result<(), Error>
where
    F: NorFlash<Error = FlashError>,
{
    if dry_run {
        return Ok(());
    }

    flash.write(address, data).await?;

    let readback = &mut readback[..data.len()];
    flash.read(address, readback).await?;
    match data.iter().zip(readback.iter()).position(|(a, b)| a != b) {
        Some(offset) => {
            let address = address + offset as u32;
            log::error!("read-back mismatch at {=u32:#x}", address);
            Err(Error::Verify { address })
        }
        None => Ok(()),
    }
}
