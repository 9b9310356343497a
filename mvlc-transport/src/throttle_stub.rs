// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! No-op throttler for platforms without netlink socket diagnostics.
//! The MVLC still blocks readout triggers when its internal buffers fill;
//! only the host-side early backpressure is missing.

use std::sync::Arc;

use tracing::warn;

use mvlc_common::{MvlcError, Protected};

use crate::eth::{EthConnection, EthThrottleCounters};

pub(crate) struct ThrottleHandle;

impl ThrottleHandle {
    pub(crate) fn spawn(
        _conn: &EthConnection,
        _counters: Arc<Protected<EthThrottleCounters>>,
    ) -> Result<Self, MvlcError> {
        warn!("socket fill-level sampling is not available on this platform, throttling disabled");
        Err(MvlcError::Io(std::io::Error::other(
            "throttling unsupported on this platform",
        )))
    }

    pub(crate) fn stop(self) {}
}
