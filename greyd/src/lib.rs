pub mod binconfig;
pub mod ctl;
pub mod logging;
pub mod net;
