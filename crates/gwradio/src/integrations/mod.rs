pub mod xiaomi_gateway_radio;
