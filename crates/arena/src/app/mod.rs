pub(crate) mod battle;
pub(crate) mod bootstrap;
pub(crate) mod loop_runner;
pub(crate) mod sim;
