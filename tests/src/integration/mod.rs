mod delivery;
mod reliability;
mod runtime;
