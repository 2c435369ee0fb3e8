use std::sync::Arc;

use tiocl_devmgr::{KernelFn, KernelTable};
use tiocl_mbox::{CoreMessage, HostMessage};

use super::{CoreSet, Device, DeviceId, DeviceInfo, DeviceKind, DeviceWork, Partition};
use crate::ClResult;

/// A partition of another device's compute units.
///
/// Only identity, compute units, and partition metadata belong to the sub-device; everything
/// else goes to the parent unchanged.
#[derive(Debug)]
pub struct SubDevice {
    id: DeviceId,
    parent: Arc<dyn Device>,
    units: CoreSet,
    partition: Partition,
}

impl SubDevice {
    pub(crate) fn new(
        id: DeviceId,
        parent: Arc<dyn Device>,
        units: CoreSet,
        partition: Partition,
    ) -> Self {
        Self {
            id,
            parent,
            units,
            partition,
        }
    }

    pub fn parent(&self) -> &Arc<dyn Device> {
        &self.parent
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }
}

impl Device for SubDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn info(&self) -> DeviceInfo {
        let parent = self.parent.info();
        DeviceInfo {
            id: self.id,
            name: format!("{} partition", parent.name),
            compute_units: self.units.iter().copied().collect(),
            parent: Some(parent.id),
            partition: Some(self.partition.clone()),
            ..parent
        }
    }

    fn kind(&self) -> DeviceKind {
        self.parent.kind()
    }

    fn compute_units(&self) -> CoreSet {
        self.units.clone()
    }

    fn root(&self) -> DeviceId {
        self.parent.root()
    }

    fn is_available(&self) -> bool {
        self.parent.is_available()
    }

    fn push_event(&self, work: DeviceWork) -> ClResult<()> {
        self.parent.push_event(work)
    }

    fn get_event(&self) -> Option<DeviceWork> {
        self.parent.get_event()
    }

    fn got_enough_to_work_on(&self) -> bool {
        self.parent.got_enough_to_work_on()
    }

    fn push_complete_pending(&self, idx: u32, work: DeviceWork, count: usize) {
        self.parent.push_complete_pending(idx, work, count)
    }

    fn get_complete_pending(&self, idx: u32, retcode: i32) -> Option<(DeviceWork, i32)> {
        self.parent.get_complete_pending(idx, retcode)
    }

    fn num_complete_pending(&self) -> usize {
        self.parent.num_complete_pending()
    }

    fn mail_to(&self, msg: &HostMessage, units: &CoreSet) -> ClResult<()> {
        self.parent.mail_to(msg, units)
    }

    fn mail_from(&self, units: &CoreSet) -> ClResult<Option<CoreMessage>> {
        self.parent.mail_from(units)
    }

    fn mail_query(&self, units: &CoreSet) -> bool {
        self.parent.mail_query(units)
    }

    fn builtin_kernels(&self) -> Vec<String> {
        self.parent.builtin_kernels()
    }

    fn builtin_kernel(&self, name: &str) -> Option<(KernelFn, Option<u32>)> {
        self.parent.builtin_kernel(name)
    }

    fn kernel_table(&self) -> Option<Arc<KernelTable>> {
        self.parent.kernel_table()
    }

    fn shutdown(&self) {
        self.parent.shutdown()
    }
}
