//! Permission gate - static role to permission matrix.
//!
//! Every mutating API route names the permission it needs; the check is a pure lookup so it
//! can be used from handlers, background jobs and tests alike.

use crate::{
    entities::StaffRole,
    errors::{Error, Result},
};
use serde::Serialize;

/// Actions guarded by the permission gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ViewAppointments,
    ManageAppointments,
    BookOwnAppointments,
    ViewCustomers,
    ManageCustomers,
    /// Merge and GDPR erase
    DeleteCustomers,
    ViewCatalog,
    ManageCatalog,
    ManageStaff,
    UsePos,
    RefundOrders,
    ViewReports,
    TrackOwnTime,
    ManageTimeEntries,
    ManageSettings,
    ManageIntegrations,
    ManageDropIn,
}

const OWNER: &[Permission] = &[
    Permission::ViewAppointments,
    Permission::ManageAppointments,
    Permission::BookOwnAppointments,
    Permission::ViewCustomers,
    Permission::ManageCustomers,
    Permission::DeleteCustomers,
    Permission::ViewCatalog,
    Permission::ManageCatalog,
    Permission::ManageStaff,
    Permission::UsePos,
    Permission::RefundOrders,
    Permission::ViewReports,
    Permission::TrackOwnTime,
    Permission::ManageTimeEntries,
    Permission::ManageSettings,
    Permission::ManageIntegrations,
    Permission::ManageDropIn,
];

const MANAGER: &[Permission] = &[
    Permission::ViewAppointments,
    Permission::ManageAppointments,
    Permission::BookOwnAppointments,
    Permission::ViewCustomers,
    Permission::ManageCustomers,
    Permission::DeleteCustomers,
    Permission::ViewCatalog,
    Permission::ManageCatalog,
    Permission::ManageStaff,
    Permission::UsePos,
    Permission::RefundOrders,
    Permission::ViewReports,
    Permission::TrackOwnTime,
    Permission::ManageTimeEntries,
    Permission::ManageIntegrations,
    Permission::ManageDropIn,
];

const BARBER: &[Permission] = &[
    Permission::ViewAppointments,
    Permission::ManageAppointments,
    Permission::ViewCustomers,
    Permission::ManageCustomers,
    Permission::ViewCatalog,
    Permission::UsePos,
    Permission::TrackOwnTime,
    Permission::ManageDropIn,
];

const CASHIER: &[Permission] = &[
    Permission::ViewAppointments,
    Permission::ViewCustomers,
    Permission::ManageCustomers,
    Permission::ViewCatalog,
    Permission::UsePos,
    Permission::TrackOwnTime,
    Permission::ManageDropIn,
];

const CUSTOMER: &[Permission] = &[Permission::BookOwnAppointments, Permission::ViewCatalog];

/// All permissions granted to `role`.
#[must_use]
pub const fn permissions_for(role: StaffRole) -> &'static [Permission] {
    match role {
        StaffRole::Owner => OWNER,
        StaffRole::Manager => MANAGER,
        StaffRole::Barber => BARBER,
        StaffRole::Cashier => CASHIER,
        StaffRole::Customer => CUSTOMER,
    }
}

/// Whether `role` is granted `permission`.
#[must_use]
pub fn has_permission(role: StaffRole, permission: Permission) -> bool {
    permissions_for(role).contains(&permission)
}

/// Fails with `Error::Forbidden` unless `role` is granted `permission`.
pub fn require(role: StaffRole, permission: Permission) -> Result<()> {
    if has_permission(role, permission) {
        Ok(())
    } else {
        Err(Error::Forbidden {
            permission: format!("{permission:?}"),
        })
    }
}
