pub mod quantify;
