//! Typed ID definitions for jobplane resources.

use crate::define_id;

define_id!(
    /// Identifies an asynchronous job.
    JobId,
    "job"
);

define_id!(
    /// Identifies a firewall rule.
    RuleId,
    "fwr"
);

define_id!(
    /// Identifies a virtual machine.
    MachineId,
    "vm"
);

define_id!(
    /// Identifies an inbound API request (for log correlation).
    RequestId,
    "req"
);
