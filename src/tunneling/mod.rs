pub(crate) mod jumphost;
pub(crate) mod port;
pub(crate) mod resolver;
pub(crate) mod session;
pub(crate) mod tunnel;
