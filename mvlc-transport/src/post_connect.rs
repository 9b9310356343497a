// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Shared connect-time device checks: identity verification and handling
//! of DAQ-mode state left behind by a previous session.

use tracing::{info, warn};

use mvlc_common::MvlcError;
use mvlc_dialog::{util, Dialog};
use mvlc_proto::constants::registers;
use mvlc_proto::PipeIo;

pub(crate) fn verify_and_cleanup<T: PipeIo>(
    io: T,
    disable_triggers: bool,
) -> Result<(), MvlcError> {
    let mut dialog = Dialog::new(io);

    let hardware_id = dialog.read_register(registers::HARDWARE_ID)?;

    if hardware_id != registers::HARDWARE_ID_MVLC {
        warn!(hardware_id = format_args!("0x{hardware_id:04x}"), "unexpected hardware id");
        return Err(MvlcError::WrongDeviceIdentity(hardware_id));
    }

    let firmware = dialog.read_register(registers::FIRMWARE_REVISION)?;
    info!(firmware = format_args!("FW{firmware:04x}"), "connected to MVLC");

    let daq_mode = util::read_daq_mode(&mut dialog)?;

    if daq_mode != 0 {
        if !disable_triggers {
            warn!("MVLC is in use (DAQ mode register is set)");
            return Err(MvlcError::InUse);
        }

        util::disable_all_triggers_and_daq_mode(&mut dialog)?;
        info!("cleared DAQ mode and stack triggers left by a previous session");
    }

    Ok(())
}
