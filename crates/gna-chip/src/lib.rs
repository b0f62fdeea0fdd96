//! Silicon model for the GNA (Gaussian & Neural Accelerator) scoring engine.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the device as the driver sees it: register offsets and bit
//! definitions, the BAR0 window, the hardware descriptor the MMU walks, the
//! XNN layer-descriptor fields a scoring request may override, and PCIe ids.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`pcie`] | Vendor/device ids, generation lookup |
//! | [`bar`] | BAR0 window size and index |
//! | [`regs`] | BAR0 register map with bit definitions |
//! | [`descriptor`] | 784-byte hardware descriptor, MMU page directory, page-table geometry |
//! | [`layer`] | XNN layer-descriptor field offsets |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bar;
pub mod descriptor;
pub mod layer;
pub mod pcie;
pub mod regs;
