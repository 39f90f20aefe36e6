pub mod benchtemplate;
pub mod joinbench;
pub mod scanbench;
