mod background;
mod blame;
mod cluster;
mod details;
mod fixture;
mod search;
